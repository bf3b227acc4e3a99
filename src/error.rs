use thiserror::Error;

/// Errors that can occur when talking to an FTMS treadmill
#[derive(Error, Debug)]
pub enum FtmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No peripheral advertising the Fitness Machine service was found
    #[error("FTMS device not found")]
    DeviceNotFound,

    /// The wireless link could not be established
    #[error("Failed to establish link: {0}")]
    LinkFailed(String),

    /// The wireless link dropped
    #[error("Device disconnected")]
    Disconnected,

    /// Link operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A mandatory service or characteristic is missing
    #[error("Profile discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A field would read past the end of the notification buffer
    #[error("Truncated buffer reading {field}: need {needed} bytes, {available} available")]
    TruncatedBuffer {
        /// Field being read
        field: &'static str,
        /// Bytes required for the field
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// The notification uses a layout this decoder does not handle
    #[error("Unsupported notification format: {0}")]
    UnsupportedFormat(String),

    /// A training status outside the supported subset
    #[error("Unrecognized training status: {0}")]
    UnrecognizedStatus(String),

    /// The peripheral has no control point characteristic
    #[error("Control point not available")]
    ControlUnavailable,

    /// Another control point write is still outstanding
    #[error("A control point command is already in flight")]
    CommandInFlight,

    /// A characteristic write did not complete
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Post-Workout arrived before any running sample was recorded
    #[error("No telemetry sample available to close the session")]
    NoSampleForSessionEnd,

    /// Computed session window is empty
    #[error("Session window is empty: start is not before end")]
    EmptySession,

    /// Operation not valid in the current connection state
    #[error("Invalid connection state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for FTMS operations
pub type Result<T> = std::result::Result<T, FtmsError>;

/// Coarse failure classes used to decide how an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Link could not be established or was lost
    LinkFailure,
    /// Mandatory profile elements missing
    DiscoveryFailure,
    /// A single notification could not be decoded
    DecodeFailure,
    /// A control command was rejected or not written
    CommandFailure,
    /// A session summary could not be computed
    SessionComputeFailure,
    /// Anything else
    Other,
}

impl FtmsError {
    /// Failure class of this error
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Ble(_)
            | Self::DeviceNotFound
            | Self::LinkFailed(_)
            | Self::Disconnected
            | Self::Timeout { .. } => ErrorCategory::LinkFailure,
            Self::DiscoveryFailed(_) => ErrorCategory::DiscoveryFailure,
            Self::TruncatedBuffer { .. } | Self::UnsupportedFormat(_) | Self::UnrecognizedStatus(_) => {
                ErrorCategory::DecodeFailure
            }
            Self::ControlUnavailable | Self::CommandInFlight | Self::WriteFailed(_) => {
                ErrorCategory::CommandFailure
            }
            Self::NoSampleForSessionEnd | Self::EmptySession => {
                ErrorCategory::SessionComputeFailure
            }
            Self::InvalidState { .. } | Self::Storage(_) => ErrorCategory::Other,
        }
    }

    /// Check if this error indicates a link issue
    #[must_use]
    pub const fn is_link_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::LinkFailure)
    }

    /// Check if this error came from decoding a single notification
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::DecodeFailure)
    }

    /// Check if the stream can carry on after this error
    ///
    /// Decode and session failures only cost the offending notification.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::DecodeFailure | ErrorCategory::SessionComputeFailure
        ) || matches!(self, Self::CommandInFlight | Self::Timeout { .. })
    }
}
