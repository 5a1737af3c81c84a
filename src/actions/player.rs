//! Executes actions on the robot.
//!
//! Speech and interrupting animations run one at a time, in order.
//! Non-interrupting animations are spawned so they overlap the speech
//! timeline; they are drained before the lease is released, on error paths
//! as well. The first failing action stops playback and triggers the lease
//! release.

use super::Action;
use super::extractor::ActionExtractor;
use crate::config::RobotConfig;
use crate::error::{KgError, Result};
use crate::pipeline::messages::FeedItem;
use crate::pipeline::segmenter::SentenceReader;
use crate::robot::RobotConnection;
use crate::robot::control::{ControlLease, ReleaseReason};
use crate::robot::idle::IdleAnimationLoop;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Counts from a streaming playback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub sentences: usize,
    pub actions: usize,
}

/// Plays [`Action`]s against a robot connection.
pub struct ActionPlayer {
    robot: Arc<dyn RobotConnection>,
    animations: BTreeMap<String, String>,
    sounds: BTreeMap<String, String>,
    say_duration_scalar: f32,
    cancel: CancellationToken,
    background: JoinSet<(String, Result<()>)>,
}

impl std::fmt::Debug for ActionPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPlayer")
            .field("serial", &self.robot.serial())
            .field("background", &self.background.len())
            .finish_non_exhaustive()
    }
}

impl ActionPlayer {
    pub fn new(robot: Arc<dyn RobotConnection>, config: &RobotConfig) -> Self {
        Self {
            robot,
            animations: config.animations.clone(),
            sounds: config.sounds.clone(),
            say_duration_scalar: config.say_duration_scalar,
            cancel: CancellationToken::new(),
            background: JoinSet::new(),
        }
    }

    /// Stop before the next action once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Play `actions` in order.
    ///
    /// Returns how many actions were executed (unknown animation or sound
    /// names are skipped and not counted).
    ///
    /// # Errors
    ///
    /// On the first failure the remaining actions are skipped, in-flight
    /// background animations are drained, `lease` is told to release, and
    /// the error is returned. Executed actions are not
    /// undone.
    pub async fn play(&mut self, actions: &[Action], lease: &ControlLease) -> Result<usize> {
        let mut played = 0;
        for action in actions {
            if self.cancel.is_cancelled() {
                self.abandon(lease, ReleaseReason::Cancelled).await;
                return Err(KgError::Cancelled);
            }
            match self.play_action(action).await {
                Ok(true) => played += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(?action, error = %e, "action failed, stopping playback");
                    self.abandon(lease, ReleaseReason::PlaybackFailed).await;
                    return Err(e);
                }
            }
        }
        Ok(played)
    }

    /// Play sentences from `reader` as they complete.
    ///
    /// Blocks while caught up with the stream. The idle loop is stopped
    /// (and waited for) before anything from the first sentence is played.
    ///
    /// # Errors
    ///
    /// Returns the first playback error, a stream failure as
    /// [`KgError::Stream`], or [`KgError::Cancelled`]. Every error path
    /// triggers the lease release.
    pub async fn play_stream(
        &mut self,
        reader: &mut SentenceReader,
        extractor: &ActionExtractor,
        lease: &ControlLease,
        idle: &mut IdleAnimationLoop,
    ) -> Result<PlaybackSummary> {
        let mut summary = PlaybackSummary::default();
        loop {
            let item = tokio::select! {
                item = reader.next() => item,
                _ = self.cancel.cancelled() => {
                    idle.stop().await;
                    self.abandon(lease, ReleaseReason::Cancelled).await;
                    return Err(KgError::Cancelled);
                }
            };

            match item {
                FeedItem::Sentence { index, text } => {
                    if index == 0 {
                        idle.stop().await;
                    }
                    let actions = extractor.extract(&text);
                    debug!(index, actions = actions.len(), "playing sentence");
                    summary.actions += self.play(&actions, lease).await?;
                    summary.sentences += 1;
                }
                FeedItem::End => {
                    idle.stop().await;
                    return Ok(summary);
                }
                FeedItem::Failed(e) => {
                    idle.stop().await;
                    self.abandon(lease, ReleaseReason::PlaybackFailed).await;
                    return Err(KgError::Stream(e));
                }
            }
        }
    }

    /// Wait for every non-interrupting animation still running.
    ///
    /// Their failures are logged, not returned.
    pub async fn drain_background(&mut self) {
        while let Some(joined) = self.background.join_next().await {
            match joined {
                Ok((name, Err(e))) => {
                    warn!(animation = %name, error = %e, "background animation failed");
                }
                Ok((_, Ok(()))) => {}
                Err(e) => warn!(error = %e, "background animation task failed"),
            }
        }
    }

    async fn abandon(&mut self, lease: &ControlLease, reason: ReleaseReason) {
        self.drain_background().await;
        lease.trigger_release(reason);
    }

    /// Play one action. Returns `false` if it was skipped.
    async fn play_action(&mut self, action: &Action) -> Result<bool> {
        match action {
            Action::SayText(text) => {
                self.robot
                    .say_text(text, self.say_duration_scalar)
                    .await
                    .map_err(|e| KgError::Playback(format!("say_text failed: {e}")))?;
                Ok(true)
            }
            Action::PlayAnimation { name, interrupting } => {
                let Some(animation) = self.animations.get(name).cloned() else {
                    warn!(animation = %name, "unknown animation, skipping");
                    return Ok(false);
                };
                if *interrupting {
                    self.robot.play_animation(&animation).await.map_err(|e| {
                        KgError::Playback(format!("play_animation {animation} failed: {e}"))
                    })?;
                } else {
                    let robot = Arc::clone(&self.robot);
                    self.background.spawn(async move {
                        let result = robot.play_animation(&animation).await;
                        (animation, result)
                    });
                }
                Ok(true)
            }
            Action::PlaySound(name) => {
                let Some(path) = self.sounds.get(name) else {
                    warn!(sound = %name, "unknown sound, skipping");
                    return Ok(false);
                };
                self.robot
                    .play_sound(path)
                    .await
                    .map_err(|e| KgError::Playback(format!("play_sound {path} failed: {e}")))?;
                Ok(true)
            }
        }
    }
}
