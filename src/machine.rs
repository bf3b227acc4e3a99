//! Connection and workout state, as a synchronous transition table.
//!
//! Every transition method mutates the machine and returns the events it
//! produced. Nothing here performs I/O or sleeps; the [`crate::Treadmill`]
//! driver applies the returned events and schedules any retry.

use crate::{
    error::{FtmsError, Result},
    session::{self, SessionStep, SessionWindow},
    types::{
        ConnectionState, ReconnectPolicy, SpeedLimits, TrainingStatus, TrainingStatusKind,
        TreadmillEvent, TreadmillSample,
    },
};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A reconnection attempt to run after `delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Attempt number, starting at 1
    pub attempt: u8,
    /// Backoff before the attempt
    pub delay: Duration,
    /// Machine epoch the retry belongs to
    pub epoch: u64,
}

/// Result of feeding a training status into the machine
#[derive(Debug)]
pub struct StatusTransition {
    /// Events to publish
    pub events: Vec<TreadmillEvent>,
    /// A closed session waiting for its average speed, or why none closed
    pub session: Result<Option<SessionWindow>>,
}

/// Result of a target speed change
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedChange {
    /// New target in mph
    pub target_mph: f64,
    /// The belt is running, so the target must also be written to the machine
    pub send: bool,
    /// Events to publish
    pub events: Vec<TreadmillEvent>,
}

/// Connection state machine
///
/// Owns the connection state, reconnection counter, target speed, last
/// running sample, current training status and session start. The epoch
/// advances whenever pending retries become stale, so a timer that fires
/// after a cancel or disconnect can be recognised and dropped.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    limits: SpeedLimits,
    state: ConnectionState,
    was_connected: bool,
    attempt: u8,
    epoch: u64,
    status: TrainingStatusKind,
    session_start: Option<SystemTime>,
    derive_start: bool,
    last_sample: Option<TreadmillSample>,
    target_speed_mph: f64,
}

impl ConnectionMachine {
    /// Create a disconnected machine
    #[must_use]
    pub fn new(policy: ReconnectPolicy, limits: SpeedLimits) -> Self {
        Self {
            policy,
            limits,
            state: ConnectionState::Disconnected,
            was_connected: false,
            attempt: 0,
            epoch: 0,
            status: TrainingStatusKind::Idle,
            session_start: None,
            derive_start: false,
            last_sample: None,
            target_speed_mph: limits.default_target_mph,
        }
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a link was established since the last terminal disconnect
    #[must_use]
    pub const fn was_connected(&self) -> bool {
        self.was_connected
    }

    /// Current training status
    #[must_use]
    pub const fn status(&self) -> TrainingStatusKind {
        self.status
    }

    /// Stored target speed in mph
    #[must_use]
    pub const fn target_speed_mph(&self) -> f64 {
        self.target_speed_mph
    }

    /// Last sample taken while the belt was running
    #[must_use]
    pub const fn last_sample(&self) -> Option<&TreadmillSample> {
        self.last_sample.as_ref()
    }

    /// Start of the open session, if any
    #[must_use]
    pub const fn session_start(&self) -> Option<SystemTime> {
        self.session_start
    }

    /// Whether a retry scheduled under `epoch` is still wanted
    #[must_use]
    pub const fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn enter(&mut self, state: ConnectionState) -> TreadmillEvent {
        debug!("Connection state {} -> {}", self.state, state);
        self.state = state;
        TreadmillEvent::state_changed(state)
    }

    fn resolve_disconnected(&mut self) -> Vec<TreadmillEvent> {
        self.epoch += 1;
        self.was_connected = false;
        self.attempt = 0;
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        vec![
            self.enter(ConnectionState::Disconnected),
            TreadmillEvent::Disconnected,
        ]
    }

    fn invalid_state(&self) -> FtmsError {
        FtmsError::InvalidState {
            state: self.state.to_string(),
        }
    }

    /// `connect()` requested
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless the machine is disconnected.
    pub fn begin_connect(&mut self) -> Result<Vec<TreadmillEvent>> {
        if self.state != ConnectionState::Disconnected {
            return Err(self.invalid_state());
        }
        self.epoch += 1;
        Ok(vec![self.enter(ConnectionState::Connecting)])
    }

    /// Link established and profile discovered
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] if the connect was abandoned meanwhile.
    pub fn connect_succeeded(&mut self) -> Result<Vec<TreadmillEvent>> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid_state());
        }
        self.was_connected = true;
        self.attempt = 0;
        Ok(vec![self.enter(ConnectionState::Connected)])
    }

    /// Link or discovery failed during `connect()`; never retried
    pub fn connect_failed(&mut self) -> Vec<TreadmillEvent> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        self.resolve_disconnected()
    }

    fn schedule_retry(&mut self) -> (Option<Retry>, Vec<TreadmillEvent>) {
        if self.attempt >= self.policy.max_attempts {
            warn!(
                "Giving up after {} reconnection attempts",
                self.policy.max_attempts
            );
            return (None, self.resolve_disconnected());
        }
        self.attempt += 1;
        let retry = Retry {
            attempt: self.attempt,
            delay: self.policy.delay_for(self.attempt),
            epoch: self.epoch,
        };
        let event = self.enter(ConnectionState::Reconnecting {
            attempt: self.attempt,
        });
        (Some(retry), vec![event])
    }

    /// Unexpected link drop
    ///
    /// Returns the retry to schedule, or `None` when the drop needs no
    /// recovery (already disconnecting, or never connected).
    pub fn link_lost(&mut self) -> (Option<Retry>, Vec<TreadmillEvent>) {
        if self.state != ConnectionState::Connected {
            debug!("Link drop ignored in state {}", self.state);
            return (None, Vec::new());
        }
        if !self.was_connected {
            return (None, self.resolve_disconnected());
        }
        info!("Link lost, scheduling reconnection");
        self.schedule_retry()
    }

    /// A scheduled retry re-established the link and subscriptions
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] when the machine is no longer
    /// reconnecting, e.g. the retry was cancelled while it ran.
    pub fn reconnect_succeeded(&mut self) -> Result<Vec<TreadmillEvent>> {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return Err(self.invalid_state());
        }
        info!("Reconnected after {} attempt(s)", self.attempt);
        self.attempt = 0;
        Ok(vec![
            self.enter(ConnectionState::Connected),
            TreadmillEvent::Reconnected,
        ])
    }

    /// A scheduled retry failed
    pub fn reconnect_failed(&mut self) -> (Option<Retry>, Vec<TreadmillEvent>) {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return (None, Vec::new());
        }
        self.schedule_retry()
    }

    /// `cancel_reconnect()` requested; only acts while reconnecting
    pub fn cancel_reconnect(&mut self) -> Vec<TreadmillEvent> {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return Vec::new();
        }
        info!("Reconnection cancelled");
        self.resolve_disconnected()
    }

    /// `disconnect()` requested; acts from any state
    pub fn disconnect(&mut self) -> Vec<TreadmillEvent> {
        self.resolve_disconnected()
    }

    /// Training status read once on connect
    ///
    /// A machine that is already running means the session started before
    /// the link did, so its start is derived from the next sample.
    pub fn apply_initial_status(&mut self, status: TrainingStatus) -> Vec<TreadmillEvent> {
        self.status = status.kind;
        if status.kind.is_running() && self.session_start.is_none() {
            debug!("Attached mid-session, deriving start from next sample");
            self.derive_start = true;
        }
        vec![TreadmillEvent::TrainingStatusChanged(status)]
    }

    /// Training status notification
    pub fn on_training_status(&mut self, status: TrainingStatus) -> StatusTransition {
        self.status = status.kind;
        let session = match session::assemble(self.session_start, &status, self.last_sample.as_ref()) {
            Ok(SessionStep::NoOp) => Ok(None),
            Ok(SessionStep::SetStart(started_at)) => {
                self.session_start = Some(started_at);
                self.derive_start = false;
                Ok(None)
            }
            Ok(SessionStep::End(window)) => {
                self.session_start = None;
                self.derive_start = false;
                Ok(Some(window))
            }
            Err(e) => Err(e),
        };
        StatusTransition {
            events: vec![TreadmillEvent::TrainingStatusChanged(status)],
            session,
        }
    }

    /// Telemetry notification; discarded while Idle
    pub fn on_treadmill_data(&mut self, sample: TreadmillSample) -> Vec<TreadmillEvent> {
        if self.status == TrainingStatusKind::Idle {
            return Vec::new();
        }
        if self.derive_start && self.session_start.is_none() {
            let elapsed = Duration::from_secs(u64::from(sample.elapsed_seconds));
            self.session_start = sample.timestamp.checked_sub(elapsed);
            self.derive_start = false;
        }
        if self.status.is_running() {
            self.last_sample = Some(sample.clone());
        }
        vec![TreadmillEvent::TelemetrySample(sample)]
    }

    fn store_target(&mut self, target_mph: f64) -> SpeedChange {
        self.target_speed_mph = target_mph;
        SpeedChange {
            target_mph,
            send: self.status.is_running(),
            events: vec![TreadmillEvent::TargetSpeedChanged(target_mph)],
        }
    }

    fn keep_target(&self, requested: f64) -> SpeedChange {
        warn!("Ignoring non-finite speed request {}", requested);
        SpeedChange {
            target_mph: self.target_speed_mph,
            send: false,
            events: Vec::new(),
        }
    }

    /// Move the target by `delta_mph`, clamped to the adjustment range
    ///
    /// While running the adjustment starts from the measured belt speed.
    pub fn adjust_speed(&mut self, delta_mph: f64) -> SpeedChange {
        if !delta_mph.is_finite() {
            return self.keep_target(delta_mph);
        }
        let base = match (&self.last_sample, self.status.is_running()) {
            (Some(sample), true) => sample.speed_mph,
            _ => self.target_speed_mph,
        };
        let target = self.limits.clamp_adjustment(base + delta_mph);
        self.store_target(target)
    }

    /// Set the target explicitly, clamped to `[0, max]`
    pub fn set_target_speed(&mut self, mph: f64) -> SpeedChange {
        if !mph.is_finite() {
            return self.keep_target(mph);
        }
        let target = self.limits.clamp_target(mph);
        self.store_target(target)
    }
}
