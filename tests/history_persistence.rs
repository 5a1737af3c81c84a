//! Remembered chats survive a restart and are replayed to the model.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use kgsim::config::KgConfig;
use kgsim::history::{ChatHistory, JsonFileHistoryStore};
use kgsim::llm::scripted::ScriptedChatClient;
use kgsim::llm::{ChatMessage, ChatRole};
use kgsim::robot::RobotHandle;
use kgsim::robot::dry_run::DryRunRobot;
use kgsim::{KgError, TurnCoordinator};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config(chats: &Path) -> KgConfig {
    let mut config = KgConfig::default();
    config.robot.getin_delay_ms = 0;
    config.robot.success_delay_ms = 0;
    config.history.path = chats.to_path_buf();
    config
}

async fn open_history(config: &KgConfig) -> Arc<ChatHistory> {
    let store = Arc::new(JsonFileHistoryStore::new(config.history.path.clone()));
    Arc::new(
        ChatHistory::open(store, config.history.max_messages)
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn exchange_is_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("chats.json"));

    // First process: one turn.
    let client = Arc::new(ScriptedChatClient::from_deltas(&["It's sunny."]));
    let turn = TurnCoordinator::new(
        config.clone(),
        client,
        RobotHandle::new(Arc::new(DryRunRobot::new("vector-1"))),
        open_history(&config).await,
    );
    turn.run_turn("vector-1", "What's the weather?", CancellationToken::new())
        .await
        .unwrap();
    assert!(config.history.path.is_file());

    // Second process: the remembered pair precedes the new transcript.
    let client = Arc::new(ScriptedChatClient::from_deltas(&["Still sunny."]));
    let turn = TurnCoordinator::new(
        config.clone(),
        Arc::clone(&client) as _,
        RobotHandle::new(Arc::new(DryRunRobot::new("vector-1"))),
        open_history(&config).await,
    );
    turn.run_turn("vector-1", "And tomorrow?", CancellationToken::new())
        .await
        .unwrap();

    let requests = client.requests();
    assert_eq!(requests.len(), 1);
    let messages = &requests[0].messages;
    assert_eq!(messages[0].role, ChatRole::System);
    assert_eq!(
        &messages[1..],
        &[
            ChatMessage::user("What's the weather?"),
            ChatMessage::assistant("It's sunny."),
            ChatMessage::user("And tomorrow?"),
        ]
    );

    let history = open_history(&config).await;
    assert_eq!(history.get("vector-1").await.messages.len(), 4);
}

#[tokio::test]
async fn other_devices_do_not_see_the_exchange() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("chats.json"));
    let history = open_history(&config).await;
    history.append("vector-1", "hi", "hello").await.unwrap();

    let client = Arc::new(ScriptedChatClient::from_deltas(&["Hi there."]));
    let turn = TurnCoordinator::new(
        config.clone(),
        Arc::clone(&client) as _,
        RobotHandle::new(Arc::new(DryRunRobot::new("vector-2"))),
        history,
    );
    turn.run_turn("vector-2", "hey", CancellationToken::new())
        .await
        .unwrap();

    let messages = &client.requests()[0].messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1], ChatMessage::user("hey"));
}

#[tokio::test]
async fn failed_turn_is_not_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("chats.json"));
    let history = open_history(&config).await;

    let client = Arc::new(ScriptedChatClient::new());
    client.push_events(vec![
        kgsim::llm::StreamEvent::Delta("Half a thought".to_owned()),
        kgsim::llm::StreamEvent::Error("connection reset".to_owned()),
    ]);
    let turn = TurnCoordinator::new(
        config.clone(),
        client,
        RobotHandle::new(Arc::new(DryRunRobot::new("vector-1"))),
        Arc::clone(&history),
    );
    let err = turn
        .run_turn("vector-1", "Tell me a story", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, KgError::Stream(_)));
    assert!(history.get("vector-1").await.messages.is_empty());
    assert!(!config.history.path.exists());
}

#[tokio::test]
async fn save_chat_off_sends_only_the_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir.path().join("chats.json"));
    config.llm.save_chat = false;
    let history = open_history(&config).await;
    history.append("vector-1", "hi", "hello").await.unwrap();

    let client = Arc::new(ScriptedChatClient::from_deltas(&["Okay."]));
    let turn = TurnCoordinator::new(
        config.clone(),
        Arc::clone(&client) as _,
        RobotHandle::new(Arc::new(DryRunRobot::new("vector-1"))),
        Arc::clone(&history),
    );
    turn.run_turn("vector-1", "again", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(client.requests()[0].messages.len(), 2);
    assert_eq!(history.get("vector-1").await.messages.len(), 2);
}
