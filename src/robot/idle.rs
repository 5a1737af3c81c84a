//! Looping "thinking" animation shown while the robot waits for something to say.

use super::RobotConnection;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Plays one animation back to back until stopped.
///
/// [`stop`](Self::stop) lets the in-flight animation finish and waits for
/// the loop to exit, so nothing else is sent to the robot while the idle
/// animation is still running.
pub struct IdleAnimationLoop {
    robot: Arc<dyn RobotConnection>,
    animation: String,
    stop: CancellationToken,
    task: Option<JoinHandle<u32>>,
}

impl std::fmt::Debug for IdleAnimationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleAnimationLoop")
            .field("animation", &self.animation)
            .field("running", &self.is_running())
            .finish()
    }
}

impl IdleAnimationLoop {
    pub fn new(robot: Arc<dyn RobotConnection>, animation: impl Into<String>) -> Self {
        Self {
            robot,
            animation: animation.into(),
            stop: CancellationToken::new(),
            task: None,
        }
    }

    /// Start looping. Has no effect if already started or stopped.
    pub fn start(&mut self) {
        if self.task.is_some() || self.stop.is_cancelled() {
            return;
        }
        let robot = Arc::clone(&self.robot);
        let animation = self.animation.clone();
        let stop = self.stop.clone();
        self.task = Some(tokio::spawn(async move {
            let mut plays = 0u32;
            while !stop.is_cancelled() {
                if let Err(e) = robot.play_animation(&animation).await {
                    warn!(animation = %animation, error = %e, "idle animation failed, stopping loop");
                    break;
                }
                plays += 1;
            }
            debug!(animation = %animation, plays, "idle loop exited");
            plays
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for it to exit. Returns how many animations completed.
    pub async fn stop(&mut self) -> u32 {
        self.stop.cancel();
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(error = %e, "idle animation task failed");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for IdleAnimationLoop {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
