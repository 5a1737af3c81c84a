//! Exclusive control leases.
//!
//! [`ControlArbiter::acquire`] spawns a handshake task that owns the
//! behavior-control stream for the lifetime of the lease:
//!
//! ```text
//! Idle -> Requesting -> Granted -> Releasing -> Released
//!              \________________________________/
//!               connection error while requesting
//! ```
//!
//! Once a request has been sent, the task sends exactly one release,
//! whatever ends the lease: an explicit release, a playback error, the
//! turn's cancellation token, a grant timeout, or the [`ControlLease`] being
//! dropped. If the connection itself fails before the grant, the task goes
//! straight to `Released` without sending anything.

use super::{
    BehaviorControlStream, ControlMessage, ControlPriority, ControlResponse, RobotConnection,
    RobotHandle,
};
use crate::config::{ContentionPolicy, RobotConfig};
use crate::error::{KgError, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Idle,
    Requesting,
    Granted,
    Releasing,
    Released,
}

/// Why a lease is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Completed,
    PlaybackFailed,
    Cancelled,
    TimedOut,
    Dropped,
}

/// Requests and releases behavior control on one robot connection.
#[derive(Debug, Clone)]
pub struct ControlArbiter {
    robot: RobotHandle,
    priority: ControlPriority,
    grant_timeout: Option<Duration>,
    contention: ContentionPolicy,
}

impl ControlArbiter {
    pub fn new(robot: RobotHandle, config: &RobotConfig) -> Self {
        Self {
            robot,
            priority: ControlPriority::default(),
            grant_timeout: config.grant_timeout(),
            contention: config.contention,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: ControlPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn robot(&self) -> &RobotHandle {
        &self.robot
    }

    /// Request control and wait until it is granted.
    ///
    /// With [`ContentionPolicy::Queue`] a request made while another lease is
    /// outstanding on the same connection waits for it, sharing the grant
    /// timeout budget. With [`ContentionPolicy::FailFast`] it fails at once.
    ///
    /// # Errors
    ///
    /// - [`KgError::Control`] when the connection is busy (fail-fast), the
    ///   stream cannot be opened, or the connection fails before the grant.
    /// - [`KgError::Timeout`] when no grant arrives in time.
    /// - [`KgError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ControlLease> {
        let deadline = self.grant_timeout.map(|t| tokio::time::Instant::now() + t);
        let permit = self.take_permit(deadline, cancel).await?;

        let (state_tx, state_rx) = watch::channel(LeaseState::Idle);
        let (granted_tx, granted_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();

        let handshake = Handshake {
            conn: Arc::clone(self.robot.connection()),
            priority: self.priority,
            deadline,
            state: state_tx,
            cancel: cancel.clone(),
            _permit: permit,
        };
        let task = tokio::spawn(handshake.run(granted_tx, release_rx));

        match granted_rx.await {
            Ok(Ok(())) => Ok(ControlLease {
                state: state_rx,
                release_tx: Mutex::new(Some(release_tx)),
                task: Some(task),
            }),
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => {
                let outcome = task.await;
                Err(KgError::Control(format!(
                    "control handshake ended before a grant: {outcome:?}"
                )))
            }
        }
    }

    async fn take_permit(
        &self,
        deadline: Option<tokio::time::Instant>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        let gate = Arc::clone(self.robot.lease_gate());
        match self.contention {
            ContentionPolicy::FailFast => gate.try_acquire_owned().map_err(|_| {
                KgError::Control(format!(
                    "robot {} is busy: another control lease is outstanding",
                    self.robot.serial()
                ))
            }),
            ContentionPolicy::Queue => {
                if gate.available_permits() == 0 {
                    debug!(serial = self.robot.serial(), "waiting for outstanding control lease");
                }
                let wait = async {
                    match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, gate.acquire_owned())
                            .await
                            .map_err(|_| {
                                KgError::Timeout(
                                    "waiting for an outstanding control lease".to_owned(),
                                )
                            })?,
                        None => gate.acquire_owned().await,
                    }
                    .map_err(|_| KgError::Control("lease gate closed".to_owned()))
                };
                tokio::select! {
                    permit = wait => permit,
                    _ = cancel.cancelled() => Err(KgError::Cancelled),
                }
            }
        }
    }
}

struct Handshake {
    conn: Arc<dyn RobotConnection>,
    priority: ControlPriority,
    deadline: Option<tokio::time::Instant>,
    state: watch::Sender<LeaseState>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

enum GrantWait {
    Granted,
    /// Stop before the grant. The request was sent, so a release is owed.
    Abandon(KgError, ReleaseReason),
    /// The connection failed. Nothing more can be sent.
    Broken(KgError),
}

impl Handshake {
    fn set_state(&self, state: LeaseState) {
        self.state.send_replace(state);
        debug!(serial = self.conn.serial(), ?state, "lease state");
    }

    async fn run(
        self,
        mut granted_tx: oneshot::Sender<Result<()>>,
        release_rx: oneshot::Receiver<ReleaseReason>,
    ) -> Result<()> {
        self.set_state(LeaseState::Requesting);

        let mut stream = match self.conn.open_behavior_control().await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(LeaseState::Released);
                let _ = granted_tx.send(Err(KgError::Control(format!(
                    "failed to open behavior control: {e}"
                ))));
                return Ok(());
            }
        };

        if let Err(e) = stream
            .send(ControlMessage::Request {
                priority: self.priority,
            })
            .await
        {
            self.set_state(LeaseState::Released);
            let _ = granted_tx.send(Err(KgError::Control(format!(
                "failed to send control request: {e}"
            ))));
            return Ok(());
        }

        let wait = async {
            loop {
                tokio::select! {
                    response = stream.recv() => match response {
                        Ok(Some(ControlResponse::Granted)) => return GrantWait::Granted,
                        Ok(Some(other)) => debug!(?other, "control response while requesting"),
                        Ok(None) => {
                            return GrantWait::Broken(KgError::Control(
                                "behavior control stream closed before grant".to_owned(),
                            ));
                        }
                        Err(e) => {
                            return GrantWait::Broken(KgError::Control(format!(
                                "behavior control failed before grant: {e}"
                            )));
                        }
                    },
                    _ = sleep_until(self.deadline) => {
                        return GrantWait::Abandon(
                            KgError::Timeout("waiting for control grant".to_owned()),
                            ReleaseReason::TimedOut,
                        );
                    }
                    _ = self.cancel.cancelled() => {
                        return GrantWait::Abandon(KgError::Cancelled, ReleaseReason::Cancelled);
                    }
                    _ = granted_tx.closed() => {
                        return GrantWait::Abandon(KgError::Cancelled, ReleaseReason::Dropped);
                    }
                }
            }
        };

        let reason = match wait.await {
            GrantWait::Granted => {
                self.set_state(LeaseState::Granted);
                info!(serial = self.conn.serial(), "control granted");
                if granted_tx.send(Ok(())).is_err() {
                    ReleaseReason::Dropped
                } else {
                    self.hold(&mut stream, release_rx).await
                }
            }
            GrantWait::Abandon(err, reason) => {
                warn!(serial = self.conn.serial(), error = %err, "abandoning control request");
                let _ = granted_tx.send(Err(err));
                reason
            }
            GrantWait::Broken(err) => {
                self.set_state(LeaseState::Released);
                warn!(serial = self.conn.serial(), error = %err, "control connection failed");
                let _ = granted_tx.send(Err(err));
                return Ok(());
            }
        };

        self.set_state(LeaseState::Releasing);
        let sent = stream.send(ControlMessage::Release).await;
        self.set_state(LeaseState::Released);
        match &sent {
            Ok(()) => info!(serial = self.conn.serial(), ?reason, "control released"),
            Err(e) => warn!(serial = self.conn.serial(), ?reason, error = %e, "control release failed"),
        }
        sent
    }
}

impl Handshake {
    /// Keep the lease until it is released, watching the stream meanwhile.
    ///
    /// Losing control to a higher-priority behavior is only logged; the
    /// turn still ends with a release.
    async fn hold(
        &self,
        stream: &mut Box<dyn BehaviorControlStream>,
        mut release_rx: oneshot::Receiver<ReleaseReason>,
    ) -> ReleaseReason {
        let mut watching = true;
        loop {
            tokio::select! {
                reason = &mut release_rx => return reason.unwrap_or(ReleaseReason::Dropped),
                _ = self.cancel.cancelled() => return ReleaseReason::Cancelled,
                response = stream.recv(), if watching => match response {
                    Ok(Some(ControlResponse::Lost)) => {
                        warn!(serial = self.conn.serial(), "control lost to a robot behavior");
                    }
                    Ok(Some(other)) => debug!(?other, "control response while granted"),
                    Ok(None) | Err(_) => {
                        warn!(serial = self.conn.serial(), "behavior control stream ended while granted");
                        watching = false;
                    }
                },
            }
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A granted control lease.
///
/// Release is triggered by [`release`](Self::release),
/// [`trigger_release`](Self::trigger_release), the acquiring cancellation
/// token, or dropping the lease.
#[derive(Debug)]
pub struct ControlLease {
    state: watch::Receiver<LeaseState>,
    release_tx: Mutex<Option<oneshot::Sender<ReleaseReason>>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ControlLease {
    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn is_granted(&self) -> bool {
        self.state() == LeaseState::Granted
    }

    /// Start releasing without waiting. Later calls have no effect.
    pub fn trigger_release(&self, reason: ReleaseReason) {
        let sender = match self.release_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(reason);
        }
    }

    /// Release and wait until the release message has been sent.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the release could not be sent.
    pub async fn release(mut self, reason: ReleaseReason) -> Result<()> {
        self.trigger_release(reason);
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| KgError::Control(format!("control task failed: {e}")))?,
            None => Ok(()),
        }
    }

    /// Wait until the lease reaches [`LeaseState::Released`].
    pub async fn released(&mut self) {
        let _ = self.state.wait_for(|s| *s == LeaseState::Released).await;
    }
}

impl Drop for ControlLease {
    fn drop(&mut self) {
        self.trigger_release(ReleaseReason::Dropped);
    }
}
