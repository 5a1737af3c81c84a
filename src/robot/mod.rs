//! Robot transport seam and control handling.
//!
//! The physical robot is reached through [`RobotConnection`]: a duplex
//! behavior-control stream plus animation, speech and sound calls. Only one
//! control lease may be granted per connection, enforced by the permit held
//! in [`RobotHandle`].

pub mod control;
pub mod dry_run;
pub mod idle;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Priority sent with a control request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlPriority {
    /// Take control from the robot's own behaviors.
    #[default]
    OverrideBehaviors,
    /// Take control only when no behavior is active.
    Default,
    /// Keep control until explicitly released, even across app disconnects.
    ReserveControl,
}

/// Message sent on the behavior-control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Request { priority: ControlPriority },
    Release,
}

/// Message received on the behavior-control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Control was granted.
    Granted,
    /// Control was taken away by a higher-priority behavior.
    Lost,
    /// Keep-alives and other events that do not affect the lease.
    Other(String),
}

/// Duplex behavior-control stream opened on a connection.
#[async_trait]
pub trait BehaviorControlStream: Send {
    async fn send(&mut self, message: ControlMessage) -> Result<()>;

    /// Next response. `Ok(None)` means the robot closed the stream.
    async fn recv(&mut self) -> Result<Option<ControlResponse>>;
}

/// A connection to one robot.
#[async_trait]
pub trait RobotConnection: Send + Sync {
    /// Robot serial number (ESN).
    fn serial(&self) -> &str;

    async fn open_behavior_control(&self) -> Result<Box<dyn BehaviorControlStream>>;

    /// Play a named animation and wait for it to finish.
    async fn play_animation(&self, name: &str) -> Result<()>;

    /// Speak `text` and wait for speech to finish.
    async fn say_text(&self, text: &str, duration_scalar: f32) -> Result<()>;

    /// Play a sound file and wait for it to finish.
    async fn play_sound(&self, path: &str) -> Result<()>;
}

/// Shared handle to a robot connection plus its single lease permit.
#[derive(Clone)]
pub struct RobotHandle {
    conn: Arc<dyn RobotConnection>,
    lease_gate: Arc<Semaphore>,
}

impl std::fmt::Debug for RobotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotHandle")
            .field("serial", &self.conn.serial())
            .field("lease_available", &(self.lease_gate.available_permits() > 0))
            .finish()
    }
}

impl RobotHandle {
    pub fn new(conn: Arc<dyn RobotConnection>) -> Self {
        Self {
            conn,
            lease_gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn connection(&self) -> &Arc<dyn RobotConnection> {
        &self.conn
    }

    pub fn serial(&self) -> &str {
        self.conn.serial()
    }

    pub(crate) fn lease_gate(&self) -> &Arc<Semaphore> {
        &self.lease_gate
    }
}
