use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{self, StreamExt};
use std::{collections::HashMap, time::Duration};
use tokio::{sync::RwLock, time::timeout};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    gatt::{CharacteristicHandle, GattTransport, LinkEvent, LinkEventStream},
    types::ConnectionParams,
    FTMS_SERVICE_UUID,
};

/// [`GattTransport`] over a btleplug peripheral
pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    params: ConnectionParams,
    characteristics: RwLock<HashMap<(Uuid, Uuid), Characteristic>>,
}

impl BtleplugTransport {
    /// Wrap an already discovered peripheral
    #[must_use]
    pub fn new(adapter: Adapter, peripheral: Peripheral, params: ConnectionParams) -> Self {
        Self {
            adapter,
            peripheral,
            params,
            characteristics: RwLock::new(HashMap::new()),
        }
    }

    /// Scan for Fitness Machine peripherals and take the strongest signal
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::DeviceNotFound`] if there is no adapter or no
    /// matching peripheral, or [`FtmsError::Ble`] if scanning fails.
    pub async fn discover_first(params: &ConnectionParams) -> Result<Self> {
        info!("Scanning for FTMS treadmills...");

        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(FtmsError::DeviceNotFound)?;

        adapter
            .start_scan(ScanFilter {
                services: vec![FTMS_SERVICE_UUID],
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        adapter.stop_scan().await?;

        let mut best: Option<(i16, Peripheral)> = None;
        for peripheral in adapter.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let advertises_ftms = properties.services.contains(&FTMS_SERVICE_UUID);
            let name = properties.local_name.as_deref();
            if !advertises_ftms || !name_matches(name, params.name_filter.as_deref()) {
                continue;
            }

            let rssi = properties.rssi.unwrap_or(i16::MIN);
            info!(
                "Found FTMS device {} ({} dBm)",
                name.unwrap_or("<unnamed>"),
                rssi
            );
            if best.as_ref().map_or(true, |(best_rssi, _)| rssi > *best_rssi) {
                best = Some((rssi, peripheral));
            }
        }

        let (_, peripheral) = best.ok_or(FtmsError::DeviceNotFound)?;
        Ok(Self::new(adapter, peripheral, params.clone()))
    }

    /// Advertised local name, if any
    pub async fn local_name(&self) -> Option<String> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|properties| properties.local_name)
    }

    async fn lookup(&self, handle: &CharacteristicHandle) -> Result<Characteristic> {
        self.characteristics
            .read()
            .await
            .get(&(handle.service, handle.uuid))
            .cloned()
            .ok_or_else(|| {
                FtmsError::DiscoveryFailed(format!("characteristic {} not discovered", handle.uuid))
            })
    }
}

fn name_matches(name: Option<&str>, filter: Option<&str>) -> bool {
    match (name, filter) {
        (_, None) => true,
        (Some(name), Some(filter)) => name.to_lowercase().contains(&filter.to_lowercase()),
        (None, Some(_)) => false,
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn connect(&self) -> Result<()> {
        let timeout_ms = self.params.connect_timeout_ms;
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            timeout(Duration::from_millis(timeout_ms), self.peripheral.connect())
                .await
                .map_err(|_| FtmsError::Timeout { timeout_ms })?
                .map_err(|e| FtmsError::LinkFailed(e.to_string()))?;
        }
        self.peripheral.discover_services().await?;

        let discovered: HashMap<_, _> = self
            .peripheral
            .characteristics()
            .into_iter()
            .map(|c| ((c.service_uuid, c.uuid), c))
            .collect();
        debug!("Discovered {} characteristics", discovered.len());
        *self.characteristics.write().await = discovered;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.characteristics.write().await.clear();
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn has_service(&self, service: Uuid) -> Result<bool> {
        Ok(self.peripheral.services().iter().any(|s| s.uuid == service))
    }

    async fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Option<CharacteristicHandle>> {
        Ok(self
            .characteristics
            .read()
            .await
            .get(&(service, characteristic))
            .map(|c| CharacteristicHandle {
                service,
                uuid: c.uuid,
                properties: c.properties,
            }))
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        let target = self.lookup(characteristic).await?;
        self.peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        let target = self.lookup(characteristic).await?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let target = self.lookup(characteristic).await?;
        Ok(self.peripheral.read(&target).await?)
    }

    async fn write(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let target = self.lookup(characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| FtmsError::WriteFailed(e.to_string()))
    }

    async fn events(&self) -> Result<LinkEventStream> {
        let notifications = self
            .peripheral
            .notifications()
            .await?
            .map(|notification| LinkEvent::Notification {
                characteristic: notification.uuid,
                value: notification.value,
            });

        let id = self.peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let id = id.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(gone) if gone == id => {
                        Some(LinkEvent::Disconnected)
                    }
                    _ => None,
                }
            }
        });

        Ok(Box::pin(stream::select(notifications, disconnects)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_filter() {
        assert!(name_matches(Some("KS-ST-A1P"), None));
        assert!(name_matches(None, None));
        assert!(name_matches(Some("WalkingPad R2"), Some("walkingpad")));
        assert!(!name_matches(Some("Echelon"), Some("walkingpad")));
        assert!(!name_matches(None, Some("walkingpad")));
    }

    #[test]
    fn test_ftms_uuid_is_sig_base() {
        assert_eq!(
            FTMS_SERVICE_UUID.to_string(),
            "00001826-0000-1000-8000-00805f9b34fb"
        );
    }
}
