//! Fitness Machine Control Point commands.
//!
//! Each command returns whether the write completed. The machine's indicated
//! result code arrives separately and is only logged by [`log_response`].

use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::{FtmsError, Result},
    gatt::{CharacteristicHandle, GattTransport},
    protocol::{decode_control_point_response, ControlCommand, ControlOpCode, ControlResult},
    types::ControlTiming,
};

/// Writes control commands, one at a time
pub struct ControlChannel<T: GattTransport> {
    transport: Arc<T>,
    timing: ControlTiming,
    control_point: RwLock<Option<CharacteristicHandle>>,
    in_flight: Mutex<()>,
}

impl<T: GattTransport> ControlChannel<T> {
    /// Create a channel with no control point attached
    #[must_use]
    pub fn new(transport: Arc<T>, timing: ControlTiming) -> Self {
        Self {
            transport,
            timing,
            control_point: RwLock::new(None),
            in_flight: Mutex::new(()),
        }
    }

    /// Use `handle` for subsequent writes, or disable control with `None`
    pub async fn attach(&self, handle: Option<CharacteristicHandle>) {
        *self.control_point.write().await = handle;
    }

    /// A control point is attached
    pub async fn is_available(&self) -> bool {
        self.control_point.read().await.is_some()
    }

    async fn handle(&self) -> Result<CharacteristicHandle> {
        self.control_point
            .read()
            .await
            .clone()
            .ok_or(FtmsError::ControlUnavailable)
    }

    async fn write(&self, command: ControlCommand) -> Result<()> {
        let handle = self.handle().await?;
        let data = command.to_bytes();
        debug!("Writing {:?}: {:02X?}", command, data.as_ref());

        self.transport
            .write(&handle, &data, handle.can_write_with_response())
            .await
            .map_err(|e| match e {
                FtmsError::WriteFailed(_) => e,
                other => FtmsError::WriteFailed(other.to_string()),
            })
    }

    /// Write one command while holding the in-flight slot
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::CommandInFlight`] if another command is still
    /// outstanding, [`FtmsError::ControlUnavailable`] without a control point
    /// and [`FtmsError::WriteFailed`] if the write did not complete.
    pub async fn send(&self, command: ControlCommand) -> Result<()> {
        let _slot = self
            .in_flight
            .try_lock()
            .map_err(|_| FtmsError::CommandInFlight)?;
        self.write(command).await
    }

    async fn send_logged(&self, command: ControlCommand) -> bool {
        match self.send(command).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{:?} failed: {}", command, e);
                false
            }
        }
    }

    /// Request control of the machine
    pub async fn request_control(&self) -> bool {
        self.send_logged(ControlCommand::RequestControl).await
    }

    /// Reset the machine
    pub async fn reset(&self) -> bool {
        self.send_logged(ControlCommand::Reset).await
    }

    /// Write a target speed given in mph
    pub async fn set_speed(&self, speed_mph: f64) -> bool {
        self.send_logged(ControlCommand::set_target_speed_mph(speed_mph))
            .await
    }

    /// Stop the belt
    pub async fn stop(&self) -> bool {
        self.send_logged(ControlCommand::Stop).await
    }

    /// Pause the belt
    pub async fn pause(&self) -> bool {
        self.send_logged(ControlCommand::Pause).await
    }

    /// Wake, take control, set the target and start the belt
    ///
    /// The wake-up reset and the initial speed are best effort. Returns
    /// `false` if control is refused or the start write fails.
    pub async fn start(&self, target_mph: f64) -> bool {
        let Ok(_slot) = self.in_flight.try_lock() else {
            warn!("Start ignored: {}", FtmsError::CommandInFlight);
            return false;
        };
        info!("Starting belt at {:.1} mph", target_mph);

        if let Err(e) = self.write(ControlCommand::Reset).await {
            debug!("Wake-up reset failed: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(self.timing.wake_delay_ms)).await;

        if let Err(e) = self.write(ControlCommand::RequestControl).await {
            warn!("Control refused: {}", e);
            return false;
        }

        if let Err(e) = self
            .write(ControlCommand::set_target_speed_mph(target_mph))
            .await
        {
            debug!("Initial speed not accepted: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(self.timing.settle_delay_ms)).await;

        match self.write(ControlCommand::StartOrResume).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Start failed: {}", e);
                false
            }
        }
    }
}

/// Log an indicated Control Point response
pub fn log_response(data: &[u8]) {
    match decode_control_point_response(data) {
        Ok(response) => {
            let request = ControlOpCode::from_u8(response.request_op_code);
            if response.result == ControlResult::Success {
                debug!("Control point {:?} succeeded", request);
            } else {
                warn!(
                    "Control point {:?} answered {:?}",
                    request, response.result
                );
            }
        }
        Err(e) => warn!("Undecodable control point response {:02X?}: {}", data, e),
    }
}
