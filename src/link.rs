//! Hardware link abstraction over the platform BLE stack.
//!
//! The core logic never touches btleplug directly; it talks to the
//! [`TrainerLink`] capability trait, which is implemented once per target
//! platform. This keeps every loop and state machine deterministic under
//! unit test with a fake link.

use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, TrainerError},
    types::{ScannedDevice, WriteMode},
    COMMAND_CHAR_UUID, DIAGNOSTICS_CHAR_UUID, DIS_FIRMWARE_CHAR_UUID, FIRMWARE_CHAR_UUID,
    HEURISTICS_CHAR_UUID, MODE_CHANGE_CHAR_UUID, MONITOR_CHAR_UUID, REPS_CHAR_UUID,
    TRAINER_SERVICE_UUID,
};

/// Logical identity of a GATT characteristic used by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    /// Command write characteristic
    Command,
    /// Poll-only monitor sample characteristic
    Monitor,
    /// Rep-count notify characteristic
    Reps,
    /// Diagnostic poll characteristic
    Diagnostics,
    /// Phase-statistics poll/notify characteristic
    Heuristics,
    /// Firmware-version notify characteristic
    FirmwareRevision,
    /// Mode-change / command-response notify characteristic
    ModeChange,
    /// Standard Device-Information-Service firmware string
    DeviceInfoFirmware,
}

impl CharacteristicId {
    /// Concrete UUID of this characteristic on the wire
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Command => COMMAND_CHAR_UUID,
            Self::Monitor => MONITOR_CHAR_UUID,
            Self::Reps => REPS_CHAR_UUID,
            Self::Diagnostics => DIAGNOSTICS_CHAR_UUID,
            Self::Heuristics => HEURISTICS_CHAR_UUID,
            Self::FirmwareRevision => FIRMWARE_CHAR_UUID,
            Self::ModeChange => MODE_CHANGE_CHAR_UUID,
            Self::DeviceInfoFirmware => DIS_FIRMWARE_CHAR_UUID,
        }
    }
}

/// Link-layer lifecycle events reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The platform reports the link as established
    Connected,
    /// The platform reports the link as torn down
    Disconnected,
}

/// Capability interface over the hardware link
///
/// One implementation per platform ([`BtleLink`] for btleplug); tests use a
/// deterministic fake. Every method is a suspension point.
#[async_trait]
pub trait TrainerLink: Send + Sync {
    /// Begin platform discovery filtered to the trainer service
    async fn start_scan(&self) -> Result<()>;

    /// Stop platform discovery
    async fn stop_scan(&self) -> Result<()>;

    /// Devices seen since scanning started
    async fn discovered(&self) -> Result<Vec<ScannedDevice>>;

    /// Establish a link to the device with the given address
    ///
    /// Succeeds only once the platform reports the link as connected, not
    /// merely requested.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Tear the link down
    async fn disconnect(&self) -> Result<()>;

    /// Whether the platform currently reports the link as connected
    async fn is_connected(&self) -> bool;

    /// Read the current value of a characteristic
    async fn read(&self, characteristic: CharacteristicId) -> Result<Vec<u8>>;

    /// Write bytes to a characteristic in the given mode
    async fn write(&self, characteristic: CharacteristicId, bytes: &[u8], mode: WriteMode)
        -> Result<()>;

    /// Subscribe to notifications from a characteristic
    async fn subscribe(&self, characteristic: CharacteristicId)
        -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Negotiate the link MTU, best-effort
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Elevate the link priority, best-effort
    async fn request_high_priority(&self) -> Result<()>;

    /// Stream of link lifecycle events for the connected device
    async fn link_events(&self) -> Result<mpsc::Receiver<LinkEvent>>;
}

struct ConnectedPeripheral {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

/// [`TrainerLink`] implementation over btleplug
pub struct BtleLink {
    adapter: Adapter,
    connected: Arc<Mutex<Option<ConnectedPeripheral>>>,
    notification_routes: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>>,
}

impl BtleLink {
    /// Create a link over the first available Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Ble`] if the Bluetooth stack cannot be
    /// initialized, or [`TrainerError::DeviceNotFound`] when no adapter is
    /// present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(TrainerError::DeviceNotFound)?;

        Ok(Self {
            adapter,
            connected: Arc::new(Mutex::new(None)),
            notification_routes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        let peripherals = self.adapter.peripherals().await?;
        for peripheral in peripherals {
            if peripheral.address().to_string() == address {
                return Ok(peripheral);
            }
        }
        Err(TrainerError::DeviceNotFound)
    }

    fn resolve_characteristics(peripheral: &Peripheral) -> HashMap<Uuid, Characteristic> {
        let mut map = HashMap::new();
        for service in peripheral.services() {
            for characteristic in service.characteristics {
                map.insert(characteristic.uuid, characteristic);
            }
        }
        map
    }

    async fn characteristic(&self, id: CharacteristicId) -> Result<(Peripheral, Characteristic)> {
        let guard = self.connected.lock().await;
        let connected = guard.as_ref().ok_or(TrainerError::NotConnected)?;
        let characteristic = connected
            .characteristics
            .get(&id.uuid())
            .ok_or(TrainerError::CharacteristicMissing(id))?
            .clone();
        Ok((connected.peripheral.clone(), characteristic))
    }

    /// Route incoming notifications by UUID to per-characteristic channels
    fn spawn_notification_router(&self, peripheral: Peripheral) {
        let routes = Arc::clone(&self.notification_routes);
        tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("notification stream unavailable: {e}");
                    return;
                }
            };

            while let Some(notification) = stream.next().await {
                let sender = {
                    let routes = routes.lock().await;
                    routes.get(&notification.uuid).cloned()
                };
                if let Some(sender) = sender {
                    // drop on backpressure; the event bus is the bounded
                    // delivery surface, not this routing hop
                    let _ = sender.try_send(notification.value);
                }
            }
            debug!("notification router finished");
        });
    }
}

#[async_trait]
impl TrainerLink for BtleLink {
    async fn start_scan(&self) -> Result<()> {
        let filter = ScanFilter {
            services: vec![TRAINER_SERVICE_UUID],
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn discovered(&self) -> Result<Vec<ScannedDevice>> {
        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                devices.push(ScannedDevice {
                    name: properties.local_name,
                    address: peripheral.address().to_string(),
                    rssi: properties.rssi.unwrap_or(0),
                });
            }
        }
        Ok(devices)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.find_peripheral(address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| TrainerError::ConnectionFailed(e.to_string()))?;

        // "connect requested" is not "connected"
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(TrainerError::ConnectionFailed(
                "link did not reach connected state".to_string(),
            ));
        }

        peripheral.discover_services().await?;
        let characteristics = Self::resolve_characteristics(&peripheral);
        debug!(count = characteristics.len(), "resolved characteristics");

        self.spawn_notification_router(peripheral.clone());

        *self.connected.lock().await = Some(ConnectedPeripheral {
            peripheral,
            characteristics,
        });

        info!(address, "link established");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connected = self.connected.lock().await.take();
        self.notification_routes.lock().await.clear();
        if let Some(connected) = connected {
            connected.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let guard = self.connected.lock().await;
        if let Some(connected) = guard.as_ref() {
            connected.peripheral.is_connected().await.unwrap_or(false)
        } else {
            false
        }
    }

    async fn read(&self, characteristic: CharacteristicId) -> Result<Vec<u8>> {
        let (peripheral, gatt_char) = self.characteristic(characteristic).await?;
        Ok(peripheral.read(&gatt_char).await?)
    }

    async fn write(
        &self,
        characteristic: CharacteristicId,
        bytes: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let (peripheral, gatt_char) = self.characteristic(characteristic).await?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral.write(&gatt_char, bytes, write_type).await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: CharacteristicId) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (peripheral, gatt_char) = self.characteristic(characteristic).await?;
        peripheral.subscribe(&gatt_char).await?;

        let (tx, rx) = mpsc::channel(32);
        self.notification_routes.lock().await.insert(gatt_char.uuid, tx);
        Ok(rx)
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        // btleplug negotiates the MTU internally per platform; surfacing the
        // request keeps the call site uniform across link implementations
        debug!(mtu, "MTU negotiation delegated to platform");
        Ok(mtu)
    }

    async fn request_high_priority(&self) -> Result<()> {
        debug!("link priority elevation delegated to platform");
        Ok(())
    }

    async fn link_events(&self) -> Result<mpsc::Receiver<LinkEvent>> {
        let watched_id: PeripheralId = {
            let guard = self.connected.lock().await;
            let connected = guard.as_ref().ok_or(TrainerError::NotConnected)?;
            connected.peripheral.id()
        };

        let mut events = self.adapter.events().await?;
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let mapped = match event {
                    CentralEvent::DeviceConnected(id) if id == watched_id => LinkEvent::Connected,
                    CentralEvent::DeviceDisconnected(id) if id == watched_id => {
                        LinkEvent::Disconnected
                    }
                    _ => continue,
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_are_distinct() {
        let ids = [
            CharacteristicId::Command,
            CharacteristicId::Monitor,
            CharacteristicId::Reps,
            CharacteristicId::Diagnostics,
            CharacteristicId::Heuristics,
            CharacteristicId::FirmwareRevision,
            CharacteristicId::ModeChange,
            CharacteristicId::DeviceInfoFirmware,
        ];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a.uuid(), b.uuid());
            }
        }
    }

    #[test]
    fn test_vendor_characteristics_share_service_base() {
        let service = TRAINER_SERVICE_UUID.as_u128() & 0xFFFF_FFFF_FFFF_FFFF_FFFF_FFFF;
        for id in [
            CharacteristicId::Command,
            CharacteristicId::Monitor,
            CharacteristicId::Reps,
            CharacteristicId::Diagnostics,
            CharacteristicId::Heuristics,
            CharacteristicId::FirmwareRevision,
            CharacteristicId::ModeChange,
        ] {
            assert_eq!(id.uuid().as_u128() & 0xFFFF_FFFF_FFFF_FFFF_FFFF_FFFF, service);
        }
    }
}
