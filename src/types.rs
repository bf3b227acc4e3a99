use crate::{
    error::{FtmsError, Result},
    protocol::{TrainingStatusData, TreadmillData},
    units,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

/// One decoded telemetry notification, already normalized for consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreadmillSample {
    /// Host time the notification was received
    pub timestamp: SystemTime,
    /// Instantaneous speed in km/h
    pub speed_kmh: f64,
    /// Instantaneous speed in mph, one decimal
    pub speed_mph: f64,
    /// Total distance in metres
    pub distance_meters: u32,
    /// Total distance in miles, two decimals
    pub distance_miles: f64,
    /// Machine-reported elapsed time in seconds
    pub elapsed_seconds: u16,
    /// Elapsed time as `HH:MM:SS`
    pub formatted_time: String,
    /// Machine-reported total energy in kcal
    pub energy_kcal: u16,
}

impl TreadmillSample {
    /// Build a sample from a decoded notification
    #[must_use]
    pub fn from_data(data: &TreadmillData, timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            speed_kmh: data.instantaneous_speed_kmh,
            speed_mph: units::kmh_to_mph(data.instantaneous_speed_kmh),
            distance_meters: data.total_distance_m,
            distance_miles: units::meters_to_miles(data.total_distance_m),
            elapsed_seconds: data.elapsed_time_s,
            formatted_time: units::format_elapsed(u32::from(data.elapsed_time_s)),
            energy_kcal: data.total_energy_kcal,
        }
    }
}

/// Training statuses that drive session and gating decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingStatusKind {
    /// Machine at rest
    Idle,
    /// Workout about to begin
    PreWorkout,
    /// Workout just ended
    PostWorkout,
    /// Belt running in manual mode
    ManualMode,
}

impl TrainingStatusKind {
    /// Protocol label for this status
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PreWorkout => "Pre-Workout",
            Self::PostWorkout => "Post-Workout",
            Self::ManualMode => "Manual Mode (Quick Start)",
        }
    }

    /// Match a protocol label against the supported subset
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        [
            Self::Idle,
            Self::PreWorkout,
            Self::PostWorkout,
            Self::ManualMode,
        ]
        .into_iter()
        .find(|kind| kind.label() == label)
    }

    /// Belt is running
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::ManualMode)
    }
}

impl fmt::Display for TrainingStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A supported training status transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingStatus {
    /// Host time the status was received
    pub timestamp: SystemTime,
    /// Raw status code
    pub code: u8,
    /// Supported status
    pub kind: TrainingStatusKind,
}

impl TrainingStatus {
    /// Narrow a decoded status to the supported subset
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::UnrecognizedStatus`] for any label outside
    /// Idle, Pre-Workout, Post-Workout and Manual Mode.
    pub fn from_data(data: &TrainingStatusData, timestamp: SystemTime) -> Result<Self> {
        let kind = TrainingStatusKind::from_label(data.label)
            .ok_or_else(|| FtmsError::UnrecognizedStatus(data.label.to_string()))?;
        Ok(Self {
            timestamp,
            code: data.code,
            kind,
        })
    }
}

/// Summary of one completed workout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Store-assigned id, set once persisted
    pub id: Option<u64>,
    /// Session start (host clock)
    pub started_at: SystemTime,
    /// Session end (host clock)
    pub ended_at: SystemTime,
    /// Machine-reported duration in seconds
    pub duration_seconds: u32,
    /// Distance in miles
    pub distance_miles: f64,
    /// Mean speed of the stored samples inside the session window, in mph
    pub average_speed_mph: f64,
    /// Machine-reported energy in kcal
    pub energy_kcal: u32,
}

/// Link-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// First connection in progress
    Connecting,
    /// Link up, profile discovered, notifications subscribed
    Connected,
    /// Recovering from an unexpected drop
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u8,
    },
}

impl ConnectionState {
    /// Attempt number while reconnecting
    #[must_use]
    pub const fn attempt(&self) -> Option<u8> {
        match self {
            Self::Reconnecting { attempt } => Some(*attempt),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting { attempt } => write!(f, "Reconnecting (attempt {attempt})"),
        }
    }
}

/// Events published to presentation and storage consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreadmillEvent {
    /// Connection state transition
    ConnectionStateChanged {
        /// New state
        state: ConnectionState,
        /// Attempt number when reconnecting
        attempt: Option<u8>,
    },
    /// Link recovered after a drop; fires once per recovery
    Reconnected,
    /// New telemetry sample
    TelemetrySample(TreadmillSample),
    /// Training status transition
    TrainingStatusChanged(TrainingStatus),
    /// Workout finished
    SessionEnded(Session),
    /// Target speed changed, in mph
    TargetSpeedChanged(f64),
    /// Link gone for good
    Disconnected,
}

impl TreadmillEvent {
    /// State-change event for `state`
    #[must_use]
    pub const fn state_changed(state: ConnectionState) -> Self {
        Self::ConnectionStateChanged {
            state,
            attempt: state.attempt(),
        }
    }
}

/// Reconnection backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u8,
    /// Delay before the first attempt in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any delay in milliseconds
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based)
    ///
    /// `base × 2^(attempt-1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for(&self, attempt: u8) -> Duration {
        let exponent = u32::from(attempt.saturating_sub(1));
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

/// Fixed delays inside the start sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTiming {
    /// Pause after the wake-up reset in milliseconds
    pub wake_delay_ms: u64,
    /// Pause after setting the initial speed in milliseconds
    pub settle_delay_ms: u64,
}

impl Default for ControlTiming {
    fn default() -> Self {
        Self {
            wake_delay_ms: 300,
            settle_delay_ms: 500,
        }
    }
}

/// Target speed bounds in mph
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedLimits {
    /// Floor for increment/decrement adjustments
    pub min_adjust_mph: f64,
    /// Ceiling for every target
    pub max_mph: f64,
    /// Target before any adjustment
    pub default_target_mph: f64,
}

impl SpeedLimits {
    /// Clamp an explicitly set target to `[0, max]`
    #[must_use]
    pub fn clamp_target(&self, mph: f64) -> f64 {
        mph.clamp(0.0, self.max_mph)
    }

    /// Clamp an incremental adjustment to `[min_adjust, max]`
    #[must_use]
    pub fn clamp_adjustment(&self, mph: f64) -> f64 {
        mph.clamp(self.min_adjust_mph, self.max_mph)
    }
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            min_adjust_mph: 0.6,
            max_mph: 12.0,
            default_target_mph: 0.6,
        }
    }
}

/// Scan and connect parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Scan duration in milliseconds
    pub scan_timeout_ms: u64,
    /// Only accept peripherals whose name contains this substring
    pub name_filter: Option<String>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            scan_timeout_ms: 10_000,
            name_filter: None,
        }
    }
}

/// Complete configuration of a [`crate::Treadmill`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreadmillConfig {
    /// Reconnection backoff
    pub reconnect: ReconnectPolicy,
    /// Start sequence delays
    pub control: ControlTiming,
    /// Target speed bounds
    pub speed: SpeedLimits,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for TreadmillConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            control: ControlTiming::default(),
            speed: SpeedLimits::default(),
            event_capacity: 256,
        }
    }
}

impl TreadmillConfig {
    /// Create a configuration with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set reconnection policy
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set start sequence delays
    #[must_use]
    pub fn with_control_timing(mut self, control: ControlTiming) -> Self {
        self.control = control;
        self
    }

    /// Set target speed bounds
    #[must_use]
    pub fn with_speed_limits(mut self, speed: SpeedLimits) -> Self {
        self.speed = speed;
        self
    }

    /// Set event channel capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_training_status;

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|attempt| {
                u64::try_from(policy.delay_for(attempt).as_millis()).unwrap()
            })
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(policy.delay_for(9), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(16_000));
    }

    #[test]
    fn test_speed_limits() {
        let limits = SpeedLimits::default();
        assert!((limits.clamp_adjustment(0.1) - 0.6).abs() < f64::EPSILON);
        assert!((limits.clamp_adjustment(40.0) - 12.0).abs() < f64::EPSILON);
        assert!(limits.clamp_target(-3.0).abs() < f64::EPSILON);
        assert!((limits.clamp_target(3.5) - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sample_normalization() {
        let data = TreadmillData {
            instantaneous_speed_kmh: 10.0,
            total_distance_m: 1609,
            elapsed_time_s: 600,
            total_energy_kcal: 80,
            ..TreadmillData::default()
        };
        let sample = TreadmillSample::from_data(&data, SystemTime::UNIX_EPOCH);

        assert!((sample.speed_mph - 6.2).abs() < f64::EPSILON);
        assert!((sample.distance_miles - 1.0).abs() < f64::EPSILON);
        assert_eq!(sample.formatted_time, "00:10:00");
        assert_eq!(sample.energy_kcal, 80);
    }

    #[test]
    fn test_training_status_subset() {
        let now = SystemTime::UNIX_EPOCH;
        let idle = decode_training_status(&[0x00, 0x01]).unwrap();
        assert_eq!(
            TrainingStatus::from_data(&idle, now).unwrap().kind,
            TrainingStatusKind::Idle
        );

        let cool_down = decode_training_status(&[0x00, 0x0B]).unwrap();
        assert!(matches!(
            TrainingStatus::from_data(&cool_down, now),
            Err(FtmsError::UnrecognizedStatus(label)) if label == "Cool Down"
        ));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 3 }.to_string(),
            "Reconnecting (attempt 3)"
        );
        assert_eq!(ConnectionState::Reconnecting { attempt: 3 }.attempt(), Some(3));
        assert_eq!(ConnectionState::Connected.attempt(), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = TreadmillConfig::new();
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.control.wake_delay_ms, 300);
        assert_eq!(config.control.settle_delay_ms, 500);
        assert_eq!(config.event_capacity, 256);

        let params = ConnectionParams::default();
        assert_eq!(params.connect_timeout_ms, 30_000);
        assert!(params.name_filter.is_none());
    }
}
