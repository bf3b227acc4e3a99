use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use futures::stream::Stream;
use std::pin::Pin;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    CONTROL_POINT_CHAR_UUID, DEVICE_NAME_CHAR_UUID, FEATURE_CHAR_UUID, FTMS_SERVICE_UUID,
    GENERIC_ACCESS_SERVICE_UUID, MACHINE_STATUS_CHAR_UUID, TRAINING_STATUS_CHAR_UUID,
    TREADMILL_DATA_CHAR_UUID,
};

/// A characteristic found on the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Owning service
    pub service: Uuid,
    /// Characteristic id
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharPropFlags,
}

impl CharacteristicHandle {
    /// Supports notifications or indications
    #[must_use]
    pub fn can_subscribe(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }

    /// Supports reads
    #[must_use]
    pub fn can_read(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    /// Supports acknowledged writes
    #[must_use]
    pub fn can_write_with_response(&self) -> bool {
        self.properties.contains(CharPropFlags::WRITE)
    }
}

/// Something the link reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A subscribed characteristic changed
    Notification {
        /// Characteristic that changed
        characteristic: Uuid,
        /// Raw value
        value: Vec<u8>,
    },
    /// The link dropped without being asked to
    Disconnected,
}

/// Stream of link events for one connection
pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// GATT access to one peripheral
///
/// Implemented over btleplug by [`crate::ble::BtleplugTransport`]; anything
/// that can connect, discover, subscribe, read and write characteristics
/// can drive a [`crate::Treadmill`].
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Establish the link and discover services
    async fn connect(&self) -> Result<()>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;

    /// Whether the peripheral exposes a primary service
    async fn has_service(&self, service: Uuid) -> Result<bool>;

    /// Look up a characteristic; `None` when the peripheral does not have it
    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>>;

    /// Start notifications or indications
    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Stop notifications or indications
    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Read the current value
    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;

    /// Write a value
    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Events for the current connection; ends when the connection does
    async fn events(&self) -> Result<LinkEventStream>;
}

/// Characteristics the driver uses, as discovered on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Treadmill Data (mandatory)
    pub treadmill_data: CharacteristicHandle,
    /// Training Status (mandatory)
    pub training_status: CharacteristicHandle,
    /// Fitness Machine Status
    pub machine_status: Option<CharacteristicHandle>,
    /// Fitness Machine Control Point
    pub control_point: Option<CharacteristicHandle>,
    /// Fitness Machine Feature
    pub feature: Option<CharacteristicHandle>,
    /// Generic Access Device Name
    pub device_name: Option<CharacteristicHandle>,
}

impl DeviceProfile {
    /// Characteristics to subscribe to, mandatory ones first
    #[must_use]
    pub fn subscriptions(&self) -> Vec<&CharacteristicHandle> {
        let mut handles = vec![&self.treadmill_data, &self.training_status];
        handles.extend(
            [&self.machine_status, &self.control_point]
                .into_iter()
                .flatten()
                .filter(|handle| handle.can_subscribe()),
        );
        handles
    }
}

async fn optional<T: GattTransport + ?Sized>(
    transport: &T,
    service: Uuid,
    characteristic: Uuid,
) -> Option<CharacteristicHandle> {
    match transport.characteristic(service, characteristic).await {
        Ok(handle) => {
            if handle.is_none() {
                debug!("Optional characteristic {characteristic} not present");
            }
            handle
        }
        Err(e) => {
            warn!("Optional characteristic {characteristic} unavailable: {e}");
            None
        }
    }
}

async fn mandatory<T: GattTransport + ?Sized>(
    transport: &T,
    characteristic: Uuid,
    name: &str,
) -> Result<CharacteristicHandle> {
    transport
        .characteristic(FTMS_SERVICE_UUID, characteristic)
        .await
        .map_err(|e| FtmsError::DiscoveryFailed(format!("{name}: {e}")))?
        .ok_or_else(|| FtmsError::DiscoveryFailed(format!("{name} characteristic not found")))
}

/// Resolve the FTMS profile on a connected transport
///
/// # Errors
///
/// Returns [`FtmsError::DiscoveryFailed`] if the Fitness Machine service,
/// Treadmill Data or Training Status is missing. Everything else is optional.
pub async fn discover_profile<T: GattTransport + ?Sized>(transport: &T) -> Result<DeviceProfile> {
    let has_ftms = transport
        .has_service(FTMS_SERVICE_UUID)
        .await
        .map_err(|e| FtmsError::DiscoveryFailed(format!("Fitness Machine service: {e}")))?;
    if !has_ftms {
        return Err(FtmsError::DiscoveryFailed(
            "Fitness Machine service not found".to_string(),
        ));
    }

    let treadmill_data = mandatory(transport, TREADMILL_DATA_CHAR_UUID, "Treadmill Data").await?;
    let training_status =
        mandatory(transport, TRAINING_STATUS_CHAR_UUID, "Training Status").await?;

    let machine_status = optional(transport, FTMS_SERVICE_UUID, MACHINE_STATUS_CHAR_UUID).await;
    let control_point = optional(transport, FTMS_SERVICE_UUID, CONTROL_POINT_CHAR_UUID).await;
    let feature = optional(transport, FTMS_SERVICE_UUID, FEATURE_CHAR_UUID).await;

    let device_name = match transport.has_service(GENERIC_ACCESS_SERVICE_UUID).await {
        Ok(true) => optional(transport, GENERIC_ACCESS_SERVICE_UUID, DEVICE_NAME_CHAR_UUID).await,
        Ok(false) => None,
        Err(e) => {
            warn!("Generic Access service unavailable: {e}");
            None
        }
    };

    Ok(DeviceProfile {
        treadmill_data,
        training_status,
        machine_status,
        control_point,
        feature,
        device_name,
    })
}

/// Scripted transport for driver tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use futures::channel::mpsc;
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex, PoisonError},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct RecordedWrite {
        pub characteristic: Uuid,
        pub data: Vec<u8>,
        pub with_response: bool,
    }

    #[derive(Default)]
    struct State {
        characteristics: HashMap<Uuid, CharacteristicHandle>,
        values: HashMap<Uuid, Vec<u8>>,
        subscribed: HashSet<Uuid>,
        writes: Vec<RecordedWrite>,
        connected: bool,
        connect_calls: usize,
        failing_connects: usize,
        fail_writes: bool,
        sender: Option<mpsc::UnboundedSender<LinkEvent>>,
    }

    /// In-memory peripheral exposing a full FTMS treadmill profile
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        state: Arc<Mutex<State>>,
    }

    impl MockTransport {
        pub(crate) fn treadmill() -> Self {
            let mock = Self::default();
            let notify = CharPropFlags::NOTIFY;
            let indicate_write = CharPropFlags::INDICATE | CharPropFlags::WRITE;
            mock.add(FTMS_SERVICE_UUID, TREADMILL_DATA_CHAR_UUID, notify);
            mock.add(
                FTMS_SERVICE_UUID,
                TRAINING_STATUS_CHAR_UUID,
                notify | CharPropFlags::READ,
            );
            mock.add(FTMS_SERVICE_UUID, MACHINE_STATUS_CHAR_UUID, notify);
            mock.add(FTMS_SERVICE_UUID, CONTROL_POINT_CHAR_UUID, indicate_write);
            mock.add(FTMS_SERVICE_UUID, FEATURE_CHAR_UUID, CharPropFlags::READ);
            mock.add(
                GENERIC_ACCESS_SERVICE_UUID,
                DEVICE_NAME_CHAR_UUID,
                CharPropFlags::READ,
            );
            mock.set_value(TRAINING_STATUS_CHAR_UUID, &[0x00, 0x01]);
            mock.set_value(FEATURE_CHAR_UUID, &[0x0B, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
            mock.set_value(DEVICE_NAME_CHAR_UUID, b"WalkingPad");
            mock
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn add(&self, service: Uuid, uuid: Uuid, properties: CharPropFlags) {
            self.lock().characteristics.insert(
                uuid,
                CharacteristicHandle {
                    service,
                    uuid,
                    properties,
                },
            );
        }

        pub(crate) fn remove(&self, uuid: Uuid) {
            self.lock().characteristics.remove(&uuid);
        }

        pub(crate) fn set_value(&self, uuid: Uuid, value: &[u8]) {
            self.lock().values.insert(uuid, value.to_vec());
        }

        pub(crate) fn fail_next_connects(&self, count: usize) {
            self.lock().failing_connects = count;
        }

        pub(crate) fn fail_writes(&self, fail: bool) {
            self.lock().fail_writes = fail;
        }

        pub(crate) fn connect_calls(&self) -> usize {
            self.lock().connect_calls
        }

        pub(crate) fn is_connected(&self) -> bool {
            self.lock().connected
        }

        pub(crate) fn is_subscribed(&self, uuid: Uuid) -> bool {
            self.lock().subscribed.contains(&uuid)
        }

        pub(crate) fn writes(&self) -> Vec<RecordedWrite> {
            self.lock().writes.clone()
        }

        /// Deliver a notification on the current connection
        pub(crate) fn notify(&self, characteristic: Uuid, value: &[u8]) {
            let state = self.lock();
            if let Some(sender) = &state.sender {
                let _ = sender.unbounded_send(LinkEvent::Notification {
                    characteristic,
                    value: value.to_vec(),
                });
            }
        }

        /// Drop the link as if the peripheral went out of range
        pub(crate) fn drop_link(&self) {
            let mut state = self.lock();
            state.connected = false;
            state.subscribed.clear();
            if let Some(sender) = state.sender.take() {
                let _ = sender.unbounded_send(LinkEvent::Disconnected);
            }
        }
    }

    #[async_trait]
    impl GattTransport for MockTransport {
        async fn connect(&self) -> Result<()> {
            let mut state = self.lock();
            state.connect_calls += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(FtmsError::LinkFailed("peripheral unreachable".to_string()));
            }
            state.connected = true;
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            let mut state = self.lock();
            state.connected = false;
            state.subscribed.clear();
            state.sender = None;
            Ok(())
        }

        async fn has_service(&self, service: Uuid) -> Result<bool> {
            Ok(self
                .lock()
                .characteristics
                .values()
                .any(|handle| handle.service == service))
        }

        async fn characteristic(
            &self,
            service: Uuid,
            characteristic: Uuid,
        ) -> Result<Option<CharacteristicHandle>> {
            Ok(self
                .lock()
                .characteristics
                .get(&characteristic)
                .filter(|handle| handle.service == service)
                .cloned())
        }

        async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
            let mut state = self.lock();
            if !state.connected {
                return Err(FtmsError::Disconnected);
            }
            state.subscribed.insert(characteristic.uuid);
            Ok(())
        }

        async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
            self.lock().subscribed.remove(&characteristic.uuid);
            Ok(())
        }

        async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
            let state = self.lock();
            if !state.connected {
                return Err(FtmsError::Disconnected);
            }
            Ok(state
                .values
                .get(&characteristic.uuid)
                .cloned()
                .unwrap_or_default())
        }

        async fn write(
            &self,
            characteristic: &CharacteristicHandle,
            data: &[u8],
            with_response: bool,
        ) -> Result<()> {
            let mut state = self.lock();
            if state.fail_writes || !state.connected {
                return Err(FtmsError::WriteFailed("write rejected".to_string()));
            }
            state.writes.push(RecordedWrite {
                characteristic: characteristic.uuid,
                data: data.to_vec(),
                with_response,
            });
            Ok(())
        }

        async fn events(&self) -> Result<LinkEventStream> {
            let (sender, receiver) = mpsc::unbounded();
            self.lock().sender = Some(sender);
            Ok(Box::pin(receiver))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mock::MockTransport, *};
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_discover_full_profile() {
        let transport = MockTransport::treadmill();
        let profile = assert_ok!(discover_profile(&transport).await);

        assert_eq!(profile.treadmill_data.uuid, TREADMILL_DATA_CHAR_UUID);
        assert!(profile.control_point.is_some());
        assert!(profile.device_name.is_some());
        assert_eq!(profile.subscriptions().len(), 4);
    }

    #[tokio::test]
    async fn test_optional_characteristics_may_be_missing() {
        let transport = MockTransport::treadmill();
        for uuid in [
            CONTROL_POINT_CHAR_UUID,
            MACHINE_STATUS_CHAR_UUID,
            FEATURE_CHAR_UUID,
            DEVICE_NAME_CHAR_UUID,
        ] {
            transport.remove(uuid);
        }

        let profile = discover_profile(&transport).await.unwrap();
        assert!(profile.control_point.is_none());
        assert!(profile.feature.is_none());
        assert!(profile.device_name.is_none());
        assert_eq!(profile.subscriptions().len(), 2);
    }

    #[tokio::test]
    async fn test_mandatory_characteristics_required() {
        for uuid in [TREADMILL_DATA_CHAR_UUID, TRAINING_STATUS_CHAR_UUID] {
            let transport = MockTransport::treadmill();
            transport.remove(uuid);
            let result = discover_profile(&transport).await;
            assert!(matches!(result, Err(FtmsError::DiscoveryFailed(_))));
        }

        let transport = MockTransport::default();
        let result = discover_profile(&transport).await;
        assert!(matches!(result, Err(FtmsError::DiscoveryFailed(msg)) if msg.contains("service")));
    }

    #[test]
    fn test_handle_capabilities() {
        let handle = CharacteristicHandle {
            service: FTMS_SERVICE_UUID,
            uuid: CONTROL_POINT_CHAR_UUID,
            properties: CharPropFlags::INDICATE | CharPropFlags::WRITE,
        };
        assert!(handle.can_subscribe());
        assert!(handle.can_write_with_response());
        assert!(!handle.can_read());
    }
}
