//! btleplug-backed BLE transport.
//!
//! Advertisements and notifications are forwarded from btleplug event
//! streams into tokio channels by background tasks. Those tasks are aborted
//! on `stop_scan`/`disconnect` and when the owning value is dropped.

use std::sync::Mutex;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::config::ADVERTISEMENT_QUEUE_DEPTH;
use super::error::TransportError;
use super::transport::{Advertisement, BleConnection, BleTransport};

/// Central role on one host adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the adapter whose description contains `adapter_hint`
    /// (e.g. `hci0`), or the first one available.
    pub async fn new(adapter_hint: Option<&str>) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        let mut wanted = None;
        if let Some(hint) = adapter_hint {
            for adapter in &adapters {
                if let Ok(info) = adapter.adapter_info().await {
                    if info.contains(hint) {
                        tracing::info!(adapter = %info, "Using requested Bluetooth adapter");
                        wanted = Some(adapter.clone());
                        break;
                    }
                }
            }
        }

        let adapter = match wanted {
            Some(adapter) => adapter,
            None => {
                let first = adapters
                    .into_iter()
                    .next()
                    .ok_or(TransportError::NoAdapter)?;
                if let Some(hint) = adapter_hint {
                    tracing::warn!(hint, "Requested adapter not found, using first available");
                }
                first
            }
        };

        Ok(Self {
            adapter,
            scan_task: Mutex::new(None),
        })
    }

    /// Descriptions of every adapter on this host.
    pub async fn list_adapters() -> Result<Vec<String>, TransportError> {
        let manager = Manager::new().await?;
        let mut infos = Vec::new();
        for adapter in manager.adapters().await? {
            infos.push(adapter.adapter_info().await?);
        }
        Ok(infos)
    }

    fn abort_scan_task(&self) {
        if let Ok(mut task) = self.scan_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral_address(&peripheral).eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        Err(TransportError::PeripheralNotFound {
            address: address.to_string(),
        })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.abort_scan_task();
    }
}

/// Address string used to identify a peripheral.
///
/// CoreBluetooth hides MAC addresses, in which case the platform id is used.
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}

async fn advertisement_for(peripheral: &Peripheral) -> Option<Advertisement> {
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        name: properties.local_name,
        address: peripheral_address(peripheral),
        rssi: properties.rssi,
        services: properties.services,
    })
}

impl BleTransport for BtleplugTransport {
    type Connection = BtleplugConnection;

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        self.abort_scan_task();

        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let (tx, rx) = mpsc::channel(ADVERTISEMENT_QUEUE_DEPTH);
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                if let Some(advertisement) = advertisement_for(&peripheral).await {
                    if tx.send(advertisement).await.is_err() {
                        break;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.scan_task.lock() {
            *slot = Some(task);
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.abort_scan_task();
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<BtleplugConnection, TransportError> {
        let peripheral = self.find_peripheral(address).await?;

        tracing::debug!(address, "Connecting to peripheral");
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        Ok(BtleplugConnection {
            adapter: self.adapter.clone(),
            peripheral,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Open GATT link to one peripheral.
pub struct BtleplugConnection {
    adapter: Adapter,
    peripheral: Peripheral,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound { uuid })
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl BleConnection for BtleplugConnection {
    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&target, data, write_type).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let target = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&target).await?)
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await?;

        let mut notifications = self.peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        let id = self.peripheral.id();

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else { break };
                        if notification.uuid != characteristic {
                            continue;
                        }
                        if tx.send(notification.value).is_err() {
                            break;
                        }
                    }
                    event = central_events.next() => {
                        match event {
                            Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
            tracing::trace!(%characteristic, "Notification stream closed");
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.abort_tasks();
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
