//! Turn coordinator: one user transcript in, spoken and animated response out.
//!
//! A turn runs four tasks at once:
//!
//! - the stream reader ([`StreamReader`]) turning model deltas into sentences,
//! - the control handshake owned by the [`ControlArbiter`],
//! - the [`IdleAnimationLoop`] shown from the grant until the first sentence,
//! - this orchestration task, which plays sentences through the
//!   [`ActionPlayer`] as they complete.
//!
//! The robot is not touched until the model has accepted the request. Once
//! it has, the lease is released on every exit path. A failed turn ends the
//! robot's output early and reports the error to the caller, typed as the
//! stage that raised it.

use super::messages::{ReaderSummary, TurnOutcome};
use super::reader::{RememberTarget, StreamReader};
use super::segmenter::{SentenceReader, sentence_feed};
use crate::actions::CommandRegistry;
use crate::actions::extractor::ActionExtractor;
use crate::actions::player::{ActionPlayer, PlaybackSummary};
use crate::config::KgConfig;
use crate::error::{KgError, Result};
use crate::history::ChatHistory;
use crate::llm::ChatClient;
use crate::llm::prompt::{build_messages, build_system_prompt};
use crate::llm::tools::ToolRegistry;
use crate::robot::RobotHandle;
use crate::robot::control::{ControlArbiter, ControlLease, ReleaseReason};
use crate::robot::idle::IdleAnimationLoop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Runs conversation turns against one robot.
pub struct TurnCoordinator {
    config: KgConfig,
    client: Arc<dyn ChatClient>,
    robot: RobotHandle,
    arbiter: ControlArbiter,
    history: Arc<ChatHistory>,
    extractor: ActionExtractor,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
}

impl std::fmt::Debug for TurnCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCoordinator")
            .field("client", &self.client.name())
            .field("robot", &self.robot)
            .finish_non_exhaustive()
    }
}

impl TurnCoordinator {
    /// Coordinator with the default command registry and built-in tools.
    pub fn new(
        config: KgConfig,
        client: Arc<dyn ChatClient>,
        robot: RobotHandle,
        history: Arc<ChatHistory>,
    ) -> Self {
        let registry = Arc::new(CommandRegistry::defaults(&config.robot));
        let system_prompt = build_system_prompt(&config.llm, &registry);
        let arbiter = ControlArbiter::new(robot.clone(), &config.robot);
        Self {
            client,
            arbiter,
            robot,
            history,
            extractor: ActionExtractor::new(registry),
            tools: Arc::new(ToolRegistry::with_builtins()),
            system_prompt,
            config,
        }
    }

    /// Replace the command registry. The system prompt is rebuilt to match.
    #[must_use]
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        let registry = Arc::new(registry);
        self.system_prompt = build_system_prompt(&self.config.llm, &registry);
        self.extractor = ActionExtractor::new(registry);
        self
    }

    /// Replace the tools offered to the model.
    #[must_use]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Run one turn for `transcript` from `device_id`.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: request rejection, stream failure or
    /// timeout, tool-round exhaustion, lease acquisition failure, playback
    /// failure, or cancellation. A rejected request returns before the robot
    /// is contacted; otherwise control is released before returning.
    pub async fn run_turn(
        &self,
        device_id: &str,
        transcript: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let turn_id = Uuid::new_v4();
        let span = info_span!("turn", %turn_id, device_id);
        async move {
            info!(transcript, "turn started");

            let save_chat = self.config.llm.save_chat;
            let remembered = if save_chat {
                Some(self.history.get(device_id).await)
            } else {
                None
            };
            let messages = build_messages(&self.system_prompt, remembered.as_ref(), transcript);

            let mut stream_reader = StreamReader::new(
                Arc::clone(&self.client),
                Arc::clone(&self.tools),
                &self.config.llm,
            );
            if save_chat {
                stream_reader = stream_reader.remember_in(RememberTarget {
                    history: Arc::clone(&self.history),
                    device_id: device_id.to_owned(),
                    transcript: transcript.to_owned(),
                });
            }

            let (opened_tx, opened_rx) = oneshot::channel();
            let stream_reader = stream_reader.notify_opened(opened_tx);

            let (writer, sentences) = sentence_feed();
            let reader_cancel = cancel.child_token();
            let reader_task: JoinHandle<Result<ReaderSummary>> = tokio::spawn(
                stream_reader
                    .run(messages, writer, reader_cancel.clone())
                    .in_current_span(),
            );

            if opened_rx.await.is_err() {
                let e = join_reader(reader_task).await.err().unwrap_or_else(|| {
                    KgError::Channel("stream reader ended without opening a stream".to_owned())
                });
                error!(error = %e, "model request failed");
                return Err(e);
            }

            let played = match self.perform(sentences, &cancel).await {
                Ok(played) => played,
                Err(e) if matches!(e, KgError::Stream(_)) => {
                    // The feed carries the reader's error as text; report the original.
                    let e = join_reader(reader_task).await.err().unwrap_or(e);
                    error!(error = %e, "turn failed");
                    return Err(e);
                }
                Err(e) => {
                    reader_cancel.cancel();
                    error!(error = %e, "turn failed");
                    return Err(e);
                }
            };

            let summary = join_reader(reader_task).await?;

            info!(
                sentences = played.sentences,
                actions = played.actions,
                "turn complete"
            );
            Ok(TurnOutcome {
                turn_id,
                device_id: device_id.to_owned(),
                response_text: summary.response_text,
                sentences_played: played.sentences,
                actions_played: played.actions,
            })
        }
        .instrument(span)
        .await
    }

    /// Speak a complete text under a lease, with the usual choreography.
    ///
    /// The text is split into sentences and command spans are resolved as
    /// for a model response. Nothing is remembered.
    ///
    /// # Errors
    ///
    /// Same as [`run_turn`](Self::run_turn) minus the model errors.
    pub async fn say(&self, text: &str, cancel: CancellationToken) -> Result<TurnOutcome> {
        let turn_id = Uuid::new_v4();
        let device_id = self.robot.serial().to_owned();
        let span = info_span!("say", %turn_id, device_id = %device_id);
        async move {
            let played = self.perform(SentenceReader::from_text(text), &cancel).await?;
            Ok(TurnOutcome {
                turn_id,
                device_id,
                response_text: text.trim().to_owned(),
                sentences_played: played.sentences,
                actions_played: played.actions,
            })
        }
        .instrument(span)
        .await
    }

    /// Acquire control, play `sentences`, release.
    async fn perform(
        &self,
        mut sentences: SentenceReader,
        cancel: &CancellationToken,
    ) -> Result<PlaybackSummary> {
        let lease = self.arbiter.acquire(cancel).await?;
        let robot = Arc::clone(self.robot.connection());
        let robot_config = &self.config.robot;

        let mut idle = IdleAnimationLoop::new(Arc::clone(&robot), robot_config.idle_animation.clone());
        let mut player = ActionPlayer::new(Arc::clone(&robot), robot_config).with_cancel(cancel.clone());

        if let Some(getin) = &robot_config.getin_animation {
            pause(robot_config.getin_delay_ms).await;
            if let Err(e) = robot.play_animation(getin).await {
                warn!(animation = %getin, error = %e, "get-in animation failed");
            }
        }
        idle.start();

        let result = player
            .play_stream(&mut sentences, &self.extractor, &lease, &mut idle)
            .await;
        idle.stop().await;
        player.drain_background().await;

        match result {
            Ok(summary) => {
                if let Some(success) = &robot_config.success_animation {
                    pause(robot_config.success_delay_ms).await;
                    if let Err(e) = robot.play_animation(success).await {
                        warn!(animation = %success, error = %e, "success animation failed");
                    }
                }
                finish_lease(lease, ReleaseReason::Completed).await;
                Ok(summary)
            }
            Err(e) => {
                let reason = match e {
                    KgError::Cancelled => ReleaseReason::Cancelled,
                    _ => ReleaseReason::PlaybackFailed,
                };
                finish_lease(lease, reason).await;
                Err(e)
            }
        }
    }
}

async fn join_reader(task: JoinHandle<Result<ReaderSummary>>) -> Result<ReaderSummary> {
    task.await
        .map_err(|e| KgError::Channel(format!("stream reader task failed: {e}")))?
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

async fn finish_lease(lease: ControlLease, reason: ReleaseReason) {
    if let Err(e) = lease.release(reason).await {
        warn!(error = %e, "control release failed");
    }
}
