use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{Stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap},
    pin::Pin,
    str::FromStr,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{DeskError, Result},
    transport::{DisconnectHandler, FrameHandler, Session, Transport},
    types::{DeskConfig, DeviceInfo},
    DEVICE_NAME_PREFIX, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
};

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// BLE transport for ErgoMate desks backed by the first system adapter
pub struct BleTransport {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BleTransport {
    /// Create a transport on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`DeskError::DeviceNotFound`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        Self::with_scan_timeout(Duration::from_millis(DeskConfig::default().scan_timeout_ms)).await
    }

    /// Create a transport with a custom discovery scan duration
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`DeskError::DeviceNotFound`] if no adapter is present.
    pub async fn with_scan_timeout(scan_timeout: Duration) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DeskError::DeviceNotFound)?;

        Ok(Self {
            adapter,
            scan_timeout,
        })
    }

    /// Scan for desks advertising the ErgoMate name prefix
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::Ble`] if scanning fails.
    pub async fn discover_desks(&self) -> Result<Vec<DeviceInfo>> {
        debug!("Scanning for desks (timeout: {:?})", self.scan_timeout);
        self.scan().await?;

        let mut desks = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(info) = desk_info(&peripheral).await {
                info!("Found desk: {} ({})", info.name, info.address);
                desks.push(info);
            }
        }

        debug!("Found {} desk(s)", desks.len());
        Ok(desks)
    }

    /// Look for one desk by address
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::InvalidParameters`] for a malformed address or
    /// [`DeskError::Ble`] if scanning fails.
    pub async fn find_desk(&self, address: &str) -> Result<Option<DeviceInfo>> {
        debug!("Searching for desk at {}", address);
        let address = parse_address(address)?;

        match self.find_peripheral(address).await {
            Ok(peripheral) => Ok(desk_info(&peripheral).await),
            Err(DeskError::DeviceNotFound) => {
                warn!("Desk not found at {}", address);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_timeout).await;
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn known_peripheral(&self, address: BDAddr) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == address))
    }

    async fn find_peripheral(&self, address: BDAddr) -> Result<Peripheral> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }

        self.scan().await?;
        self.known_peripheral(address)
            .await?
            .ok_or(DeskError::DeviceNotFound)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&self, address: &str) -> Result<Box<dyn Session>> {
        let bd_addr = parse_address(address)?;
        let peripheral = self.find_peripheral(bd_addr).await?;

        debug!("Connecting to desk at {}", address);
        peripheral
            .connect()
            .await
            .map_err(|e| DeskError::Transport(format!("Failed to connect to {address}: {e}")))?;
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        for required in [WRITE_CHARACTERISTIC_UUID, NOTIFY_CHARACTERISTIC_UUID] {
            if !characteristics.iter().any(|c| c.uuid == required) {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Failed to disconnect from {}: {}", address, e);
                }
                return Err(DeskError::Transport(format!(
                    "characteristic {required} not found on {address}"
                )));
            }
        }

        let events = self.adapter.events().await?;

        Ok(Box::new(BleSession {
            peripheral,
            characteristics,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(HashMap::new()),
            watchdog: Mutex::new(None),
        }))
    }
}

/// Active connection to a desk
struct BleSession {
    peripheral: Peripheral,
    characteristics: BTreeSet<Characteristic>,
    events: Mutex<Option<EventStream>>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl BleSession {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| DeskError::Transport(format!("characteristic {uuid} not found")))
    }

    fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, task) in tasks {
            task.abort();
        }
        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.abort();
        }
    }
}

#[async_trait]
impl Session for BleSession {
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| DeskError::Transport(format!("Failed to write frame: {e}")))
    }

    async fn subscribe(&self, characteristic: Uuid, on_frame: FrameHandler) -> Result<()> {
        let target = self.characteristic(characteristic)?.clone();
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| DeskError::Transport(format!("Failed to subscribe: {e}")))?;

        let mut notifications = self.peripheral.notifications().await?;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    on_frame(&notification.value);
                }
            }
        });

        if let Some(previous) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic, task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        if let Some(task) = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&characteristic)
        {
            task.abort();
        }

        let target = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(target).await?;
        Ok(())
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        let Some(mut events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!("Disconnect handler already registered for this session");
            return;
        };

        let id = self.peripheral.id();
        let watchdog = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(lost) = event {
                    if lost == id {
                        handler();
                        break;
                    }
                }
            }
        });

        *self.watchdog.lock().unwrap_or_else(PoisonError::into_inner) = Some(watchdog);
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        // The watchdog stays armed so the controller still hears the final disconnect
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for (_, task) in tasks {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

fn parse_address(address: &str) -> Result<BDAddr> {
    BDAddr::from_str(address)
        .map_err(|e| DeskError::InvalidParameters(format!("Invalid desk address {address}: {e}")))
}

async fn desk_info(peripheral: &Peripheral) -> Option<DeviceInfo> {
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;
    if !name.starts_with(DEVICE_NAME_PREFIX) {
        return None;
    }

    Some(DeviceInfo {
        name,
        address: properties.address.to_string(),
        rssi: properties.rssi,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parsing() {
        assert!(parse_address("AA:BB:CC:DD:EE:FF").is_ok());
        assert!(parse_address("aa:bb:cc:dd:ee:ff").is_ok());

        for invalid in ["", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:ZZ", "not-an-address"] {
            assert!(
                matches!(parse_address(invalid), Err(DeskError::InvalidParameters(_))),
                "address parsing should have failed for: {invalid}"
            );
        }
    }

    #[test]
    fn test_protocol_uuids() {
        assert_eq!(
            WRITE_CHARACTERISTIC_UUID.to_string(),
            "0000ff02-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            NOTIFY_CHARACTERISTIC_UUID.to_string(),
            "0000ff01-0000-1000-8000-00805f9b34fb"
        );
    }
}
