//! A robot that only logs and records what it is asked to do.
//!
//! Lets the CLI run a full turn without hardware, and gives tests a
//! transport whose failures and timing can be scripted.

use super::{BehaviorControlStream, ControlMessage, ControlResponse, RobotConnection};
use crate::error::{KgError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Animation time used unless a test sets its own.
pub const DEFAULT_ANIMATION_DELAY: Duration = Duration::from_millis(5);

/// One call made against a [`DryRunRobot`].
#[derive(Debug, Clone, PartialEq)]
pub enum RobotCall {
    OpenControl,
    Control(ControlMessage),
    PlayAnimation(String),
    SayText { text: String, duration_scalar: f32 },
    PlaySound(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum GrantMode {
    #[default]
    Immediate,
    Never,
    StreamError,
}

#[derive(Debug, Clone, Default)]
struct Script {
    grant: GrantMode,
    fail_open: bool,
    fail_say_containing: Option<String>,
    fail_animation: Option<String>,
    animation_delay: Duration,
    speech_delay: Duration,
}

/// Robot connection that records every call.
#[derive(Debug)]
pub struct DryRunRobot {
    serial: String,
    calls: Arc<Mutex<Vec<RobotCall>>>,
    script: Script,
}

impl DryRunRobot {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Script {
                animation_delay: DEFAULT_ANIMATION_DELAY,
                ..Script::default()
            },
        }
    }

    /// Each animation call takes `delay`.
    ///
    /// A zero delay only yields, so the idle loop never waits on a timer.
    /// Under a paused test clock that stops time from auto-advancing.
    #[must_use]
    pub fn with_animation_delay(mut self, delay: Duration) -> Self {
        self.script.animation_delay = delay;
        self
    }

    /// Each say-text call takes `delay`.
    #[must_use]
    pub fn with_speech_delay(mut self, delay: Duration) -> Self {
        self.script.speech_delay = delay;
        self
    }

    /// Control requests are never answered.
    #[must_use]
    pub fn never_grant(mut self) -> Self {
        self.script.grant = GrantMode::Never;
        self
    }

    /// The control stream fails right after the request is sent.
    #[must_use]
    pub fn fail_control_stream(mut self) -> Self {
        self.script.grant = GrantMode::StreamError;
        self
    }

    /// Opening the control stream fails.
    #[must_use]
    pub fn fail_open_control(mut self) -> Self {
        self.script.fail_open = true;
        self
    }

    /// Say-text fails for text containing `needle`.
    #[must_use]
    pub fn fail_say_containing(mut self, needle: impl Into<String>) -> Self {
        self.script.fail_say_containing = Some(needle.into());
        self
    }

    /// Playing animation `name` fails.
    #[must_use]
    pub fn fail_animation(mut self, name: impl Into<String>) -> Self {
        self.script.fail_animation = Some(name.into());
        self
    }

    fn record(&self, call: RobotCall) {
        record(&self.calls, call);
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<RobotCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Text passed to say-text, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RobotCall::SayText { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Animations played, in order.
    pub fn animations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RobotCall::PlayAnimation(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.count(|c| matches!(c, RobotCall::Control(ControlMessage::Request { .. })))
    }

    pub fn release_count(&self) -> usize {
        self.count(|c| matches!(c, RobotCall::Control(ControlMessage::Release)))
    }

    fn count(&self, pred: impl Fn(&RobotCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

fn record(calls: &Mutex<Vec<RobotCall>>, call: RobotCall) {
    match calls.lock() {
        Ok(mut calls) => calls.push(call),
        Err(poisoned) => poisoned.into_inner().push(call),
    }
}

#[async_trait]
impl RobotConnection for DryRunRobot {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn open_behavior_control(&self) -> Result<Box<dyn BehaviorControlStream>> {
        self.record(RobotCall::OpenControl);
        if self.script.fail_open {
            return Err(KgError::Robot("connection refused".to_owned()));
        }
        Ok(Box::new(DryRunControlStream {
            calls: Arc::clone(&self.calls),
            grant: self.script.grant,
            pending: VecDeque::new(),
            requested: false,
        }))
    }

    async fn play_animation(&self, name: &str) -> Result<()> {
        info!(serial = %self.serial, animation = name, "dry-run: play animation");
        self.record(RobotCall::PlayAnimation(name.to_owned()));
        // A real round trip always suspends; looping callers rely on it.
        if self.script.animation_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.script.animation_delay).await;
        }
        if self.script.fail_animation.as_deref() == Some(name) {
            return Err(KgError::Robot(format!("animation {name} rejected")));
        }
        Ok(())
    }

    async fn say_text(&self, text: &str, duration_scalar: f32) -> Result<()> {
        info!(serial = %self.serial, text, "dry-run: say text");
        self.record(RobotCall::SayText {
            text: text.to_owned(),
            duration_scalar,
        });
        if !self.script.speech_delay.is_zero() {
            tokio::time::sleep(self.script.speech_delay).await;
        }
        if let Some(needle) = &self.script.fail_say_containing
            && text.contains(needle.as_str())
        {
            return Err(KgError::Robot("say text rejected".to_owned()));
        }
        Ok(())
    }

    async fn play_sound(&self, path: &str) -> Result<()> {
        info!(serial = %self.serial, path, "dry-run: play sound");
        self.record(RobotCall::PlaySound(path.to_owned()));
        Ok(())
    }
}

struct DryRunControlStream {
    calls: Arc<Mutex<Vec<RobotCall>>>,
    grant: GrantMode,
    pending: VecDeque<ControlResponse>,
    requested: bool,
}

#[async_trait]
impl BehaviorControlStream for DryRunControlStream {
    async fn send(&mut self, message: ControlMessage) -> Result<()> {
        info!(?message, "dry-run: control message");
        record(&self.calls, RobotCall::Control(message));
        if let ControlMessage::Request { .. } = message {
            self.requested = true;
            if self.grant == GrantMode::Immediate {
                self.pending.push_back(ControlResponse::Granted);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ControlResponse>> {
        if let Some(response) = self.pending.pop_front() {
            return Ok(Some(response));
        }
        if self.requested && self.grant == GrantMode::StreamError {
            return Err(KgError::Robot("connection reset".to_owned()));
        }
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::robot::ControlPriority;

    #[tokio::test]
    async fn records_calls_in_order() {
        let robot = DryRunRobot::new("esn");
        robot.play_animation("anim_a").await.unwrap();
        robot.say_text("hello", 1.0).await.unwrap();
        robot.play_sound("sounds/drumroll.wav").await.unwrap();
        assert_eq!(
            robot.calls(),
            vec![
                RobotCall::PlayAnimation("anim_a".to_owned()),
                RobotCall::SayText {
                    text: "hello".to_owned(),
                    duration_scalar: 1.0
                },
                RobotCall::PlaySound("sounds/drumroll.wav".to_owned()),
            ]
        );
        assert_eq!(robot.spoken(), vec!["hello"]);
    }

    #[tokio::test]
    async fn control_stream_grants_after_request() {
        let robot = DryRunRobot::new("esn");
        let mut stream = robot.open_behavior_control().await.unwrap();
        stream
            .send(ControlMessage::Request {
                priority: ControlPriority::OverrideBehaviors,
            })
            .await
            .unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(ControlResponse::Granted));
        assert_eq!(robot.request_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let robot = DryRunRobot::new("esn")
            .fail_say_containing("boom")
            .fail_animation("anim_bad");
        assert!(robot.say_text("this goes boom", 1.0).await.is_err());
        assert!(robot.play_animation("anim_bad").await.is_err());
        assert!(robot.play_animation("anim_ok").await.is_ok());
    }
}
