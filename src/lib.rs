#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ftms-treadmill
//!
//! Monitor and control treadmills that speak the Bluetooth Fitness Machine
//! Service (FTMS).
//!
//! The crate decodes Treadmill Data and Training Status notifications,
//! turns Pre-Workout/Post-Workout transitions into workout sessions, keeps
//! the link alive with exponential backoff, and writes Control Point
//! commands (request control, start, stop, pause, set target speed).
//!
//! ## Layout
//!
//! - [`protocol`] decodes notifications and encodes commands
//! - [`machine`] is the connection state machine, free of I/O
//! - [`device`] drives a [`Treadmill`] over any [`gatt::GattTransport`]
//! - [`ble`] provides the btleplug transport
//! - [`store`] records samples, statuses and sessions
//!
//! ## Quick Start
//!
//! ```no_run
//! use ftms_treadmill::{
//!     ble::BtleplugTransport, ConnectionParams, Treadmill, TreadmillConfig, TreadmillEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BtleplugTransport::discover_first(&ConnectionParams::default()).await?;
//!     let treadmill = Treadmill::new(transport, TreadmillConfig::default());
//!     let mut events = treadmill.subscribe();
//!
//!     treadmill.connect().await?;
//!     treadmill.set_target_speed(2.5).await;
//!     treadmill.start().await;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let TreadmillEvent::SessionEnded(session) = event {
//!             println!("{:.2} miles in {}s", session.distance_miles, session.duration_seconds);
//!             break;
//!         }
//!     }
//!
//!     treadmill.disconnect().await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// btleplug-backed GATT transport
pub mod ble;
/// Control Point command channel
pub mod control;
/// Treadmill driver
pub mod device;
/// Error types and handling
pub mod error;
/// GATT transport boundary and profile discovery
pub mod gatt;
/// Connection state machine
pub mod machine;
/// FTMS notification decoding and command encoding
pub mod protocol;
/// Workout session assembly
pub mod session;
/// Sample, status and session persistence
pub mod store;
/// Type definitions and data structures
pub mod types;
/// Unit conversions
pub mod units;

// Re-export the main types for convenient usage
pub use device::Treadmill;
pub use error::{ErrorCategory, FtmsError, Result};
pub use store::{MemoryStore, SampleStore};
pub use types::{
    ConnectionParams, ConnectionState, ControlTiming, ReconnectPolicy, Session, SpeedLimits,
    TrainingStatus, TrainingStatusKind, TreadmillConfig, TreadmillEvent, TreadmillSample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Generic Access service (0x1800)
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = sig_uuid(0x1800);

/// Device Name characteristic (0x2A00)
pub const DEVICE_NAME_CHAR_UUID: Uuid = sig_uuid(0x2A00);

/// Fitness Machine service (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Fitness Machine Feature characteristic (0x2ACC), read-only
pub const FEATURE_CHAR_UUID: Uuid = sig_uuid(0x2ACC);

/// Treadmill Data characteristic (0x2ACD), notify
pub const TREADMILL_DATA_CHAR_UUID: Uuid = sig_uuid(0x2ACD);

/// Training Status characteristic (0x2AD3), notify and read
pub const TRAINING_STATUS_CHAR_UUID: Uuid = sig_uuid(0x2AD3);

/// Fitness Machine Control Point characteristic (0x2AD9), write and indicate
pub const CONTROL_POINT_CHAR_UUID: Uuid = sig_uuid(0x2AD9);

/// Fitness Machine Status characteristic (0x2ADA), notify
pub const MACHINE_STATUS_CHAR_UUID: Uuid = sig_uuid(0x2ADA);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuids() {
        assert_eq!(
            TREADMILL_DATA_CHAR_UUID.to_string(),
            "00002acd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            GENERIC_ACCESS_SERVICE_UUID.to_string(),
            "00001800-0000-1000-8000-00805f9b34fb"
        );
    }
}
