//! End-to-end turns: scripted model stream in, dry-run robot calls out.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use kgsim::config::{ContentionPolicy, KgConfig};
use kgsim::history::ChatHistory;
use kgsim::llm::scripted::ScriptedChatClient;
use kgsim::llm::{ChatMessage, StreamEvent, ToolCall};
use kgsim::robot::dry_run::{DryRunRobot, RobotCall};
use kgsim::robot::{ControlMessage, RobotHandle};
use kgsim::{KgError, TurnCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn quick_config() -> KgConfig {
    let mut config = KgConfig::default();
    config.robot.getin_delay_ms = 0;
    config.robot.success_delay_ms = 0;
    config
}

struct Harness {
    turn: TurnCoordinator,
    client: Arc<ScriptedChatClient>,
    robot: Arc<DryRunRobot>,
    history: Arc<ChatHistory>,
}

fn harness(client: ScriptedChatClient, robot: DryRunRobot, config: KgConfig) -> Harness {
    let client = Arc::new(client);
    let robot = Arc::new(robot);
    let history = Arc::new(ChatHistory::in_memory(config.history.max_messages));
    let turn = TurnCoordinator::new(
        config,
        Arc::clone(&client) as _,
        RobotHandle::new(Arc::clone(&robot) as _),
        Arc::clone(&history),
    );
    Harness {
        turn,
        client,
        robot,
        history,
    }
}

#[tokio::test]
async fn weather_turn_speaks_releases_and_remembers() {
    let h = harness(
        ScriptedChatClient::from_deltas(&["The weather", " is sunny", " today."]),
        DryRunRobot::new("vector-1"),
        quick_config(),
    );

    let outcome = h
        .turn
        .run_turn("vector-1", "what is the weather", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.response_text, "The weather is sunny today.");
    assert_eq!(outcome.sentences_played, 1);
    assert_eq!(outcome.actions_played, 1);
    assert_eq!(h.robot.spoken(), vec!["The weather is sunny today."]);
    assert_eq!(h.robot.request_count(), 1);
    assert_eq!(h.robot.release_count(), 1);
    assert_eq!(
        h.robot.calls().last(),
        Some(&RobotCall::Control(ControlMessage::Release))
    );

    let remembered = h.history.get("vector-1").await;
    assert_eq!(
        remembered.messages,
        vec![
            ChatMessage::user("what is the weather"),
            ChatMessage::assistant("The weather is sunny today."),
        ]
    );
    assert_eq!(h.client.requests().len(), 1);
}

#[tokio::test]
async fn choreography_brackets_the_response() {
    let h = harness(
        ScriptedChatClient::from_deltas(&["Hi."]),
        DryRunRobot::new("vector-1"),
        quick_config(),
    );
    h.turn
        .run_turn("vector-1", "hello", CancellationToken::new())
        .await
        .unwrap();

    let calls = h.robot.calls();
    let position = |wanted: &RobotCall| calls.iter().position(|c| c == wanted).unwrap();
    let getin = position(&RobotCall::PlayAnimation("anim_getin_tts_01".to_owned()));
    let speech = position(&RobotCall::SayText {
        text: "Hi.".to_owned(),
        duration_scalar: 1.0,
    });
    let success = position(&RobotCall::PlayAnimation(
        "anim_knowledgegraph_success_01".to_owned(),
    ));
    let release = position(&RobotCall::Control(ControlMessage::Release));
    assert!(getin < speech);
    assert!(speech < success);
    assert!(success < release);

    // The idle loop never overlaps speech.
    let idle = RobotCall::PlayAnimation("anim_tts_loop_02".to_owned());
    assert!(calls[speech..].iter().all(|c| c != &idle));
}

#[tokio::test]
async fn commands_in_stream_drive_animation_and_sound() {
    let h = harness(
        ScriptedChatClient::from_deltas(&[
            "Great news",
            "! {{playAnimation||celebrate}} Listen",
            " to this. {{playSound||drumroll}}",
        ]),
        DryRunRobot::new("vector-1"),
        quick_config(),
    );
    let outcome = h
        .turn
        .run_turn("vector-1", "any news?", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.sentences_played, 3);
    assert_eq!(h.robot.spoken(), vec!["Great news!", "Listen to this."]);
    assert!(h
        .robot
        .animations()
        .contains(&"anim_pounce_success_03".to_owned()));
    assert!(h
        .robot
        .calls()
        .iter()
        .any(|c| matches!(c, RobotCall::PlaySound(_))));
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn playback_failure_stops_turn_and_releases_once() {
    let h = harness(
        ScriptedChatClient::from_deltas(&["First. Second boom. Third."]),
        DryRunRobot::new("vector-1").fail_say_containing("boom"),
        quick_config(),
    );

    let err = h
        .turn
        .run_turn("vector-1", "go", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Playback(_)));
    assert_eq!(h.robot.spoken(), vec!["First.", "Second boom."]);
    assert_eq!(h.robot.release_count(), 1);
    assert!(!h
        .robot
        .animations()
        .contains(&"anim_knowledgegraph_success_01".to_owned()));
}

#[tokio::test]
async fn rejected_request_leaves_robot_alone() {
    let client = ScriptedChatClient::new();
    client.push_rejection("HTTP 401: Incorrect API key provided");
    let h = harness(client, DryRunRobot::new("vector-1"), quick_config());

    let err = h
        .turn
        .run_turn("vector-1", "hello", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Llm(ref m) if m.starts_with("HTTP 401")), "{err}");
    assert!(h.robot.calls().is_empty());
    assert!(h.history.get("vector-1").await.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stalled_stream_fails_turn_with_timeout() {
    let mut config = quick_config();
    config.llm.stream_timeout_secs = 1;
    let h = harness(
        ScriptedChatClient::from_deltas(&["Too late."]).with_delay(Duration::from_secs(3)),
        DryRunRobot::new("vector-1"),
        config,
    );

    let err = h
        .turn
        .run_turn("vector-1", "hello", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Timeout(_)), "{err}");
    assert!(h.robot.spoken().is_empty());
    // The idle loop ran while waiting.
    assert!(h
        .robot
        .animations()
        .contains(&"anim_tts_loop_02".to_owned()));
    assert_eq!(h.robot.request_count(), 1);
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn endless_tool_calls_fail_turn_as_tool_error() {
    let mut config = quick_config();
    config.llm.max_tool_rounds = 1;
    let client = ScriptedChatClient::new();
    for _ in 0..2 {
        client.push_events(vec![
            StreamEvent::ToolCall(ToolCall {
                id: "call_1".to_owned(),
                name: "time".to_owned(),
                arguments: "{}".to_owned(),
            }),
            StreamEvent::Done,
        ]);
    }
    let h = harness(client, DryRunRobot::new("vector-1"), config);

    let err = h
        .turn
        .run_turn("vector-1", "what time is it", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Tool(_)), "{err}");
    assert_eq!(h.client.requests().len(), 2);
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn stream_error_mid_response_ends_speech_early() {
    let client = ScriptedChatClient::new();
    client.push_events(vec![
        StreamEvent::Delta("Once upon a time. There was".to_owned()),
        StreamEvent::Error("connection reset".to_owned()),
    ]);
    let h = harness(client, DryRunRobot::new("vector-1"), quick_config());

    let err = h
        .turn
        .run_turn("vector-1", "story", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Stream(_)));
    assert!(!h.robot.spoken().contains(&"There was".to_owned()));
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn cancellation_stops_before_next_action() {
    let h = harness(
        ScriptedChatClient::from_deltas(&["One. Two. Three."]),
        DryRunRobot::new("vector-1").with_speech_delay(Duration::from_millis(200)),
        quick_config(),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = h.turn.run_turn("vector-1", "count", cancel).await.unwrap_err();

    assert!(matches!(err, KgError::Cancelled));
    assert_eq!(h.robot.spoken(), vec!["One."]);
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_grant_times_out_and_releases() {
    let h = harness(
        ScriptedChatClient::from_deltas(&["Hello."]),
        DryRunRobot::new("vector-1").never_grant(),
        quick_config(),
    );

    let err = h
        .turn
        .run_turn("vector-1", "hi", CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KgError::Timeout(_)));
    assert!(h.robot.spoken().is_empty());
    assert_eq!(h.robot.request_count(), 1);
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn fail_fast_rejects_overlapping_turn() {
    let mut config = quick_config();
    config.robot.contention = ContentionPolicy::FailFast;
    let client = ScriptedChatClient::from_deltas(&["Slow answer."]);
    client.push_deltas(&["Never spoken."]);
    let h = harness(
        client,
        DryRunRobot::new("vector-1").with_speech_delay(Duration::from_millis(300)),
        config,
    );

    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.turn
            .run_turn("vector-1", "second", CancellationToken::new())
            .await
    };
    let (first, second) = tokio::join!(
        h.turn
            .run_turn("vector-1", "first", CancellationToken::new()),
        second
    );

    first.unwrap();
    let err = second.unwrap_err();
    assert!(matches!(err, KgError::Control(_)), "{err}");
    assert_eq!(h.robot.spoken(), vec!["Slow answer."]);
    assert_eq!(h.robot.request_count(), 1);
    assert_eq!(h.robot.release_count(), 1);
}

#[tokio::test]
async fn queued_turns_take_control_in_sequence() {
    let client = ScriptedChatClient::from_deltas(&["First answer."]);
    client.push_deltas(&["Second answer."]);
    let h = harness(
        client,
        DryRunRobot::new("vector-1").with_speech_delay(Duration::from_millis(100)),
        quick_config(),
    );

    let second = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.turn
            .run_turn("vector-1", "second", CancellationToken::new())
            .await
    };
    let (first, second) = tokio::join!(
        h.turn
            .run_turn("vector-1", "first", CancellationToken::new()),
        second
    );
    first.unwrap();
    second.unwrap();

    let control: Vec<ControlMessage> = h
        .robot
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            RobotCall::Control(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(control.len(), 4);
    assert!(matches!(control[0], ControlMessage::Request { .. }));
    assert_eq!(control[1], ControlMessage::Release);
    assert!(matches!(control[2], ControlMessage::Request { .. }));
    assert_eq!(control[3], ControlMessage::Release);
    assert_eq!(h.robot.spoken(), vec!["First answer.", "Second answer."]);
}
