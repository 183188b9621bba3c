//! btleplug transport
//!
//! Scans for Beans and implements [`GattTransport`] and [`Discovery`] on top
//! of the platform Bluetooth stack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SERIAL_SERVICE;
use crate::error::TransportError;
use crate::transport::{Discovery, GattService, GattTransport, LinkEvent};

/// A discovered device
#[derive(Debug, Clone)]
pub struct BeanDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub is_bean: bool,
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// Beans advertise the serial service
fn looks_like_bean(name: &str, services: &[Uuid]) -> bool {
    services.contains(&SERIAL_SERVICE) || name.contains("Bean")
}

/// Scan for BLE devices
///
/// Returns everything seen; Beans have `is_bean = true`.
pub async fn scan(adapter: &Adapter, duration: Duration) -> Result<Vec<BeanDevice>, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let is_bean = looks_like_bean(&name, &props.services);
            devices.push(BeanDevice {
                name,
                address: peripheral.address().to_string(),
                rssi: props.rssi,
                is_bean,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

/// Find a Bean by name/address pattern, or the first Bean seen
pub async fn find_device(
    adapter: &Adapter,
    target: Option<&str>,
    duration: Duration,
) -> Result<Peripheral, TransportError> {
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await?;
    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await? {
            let name = props.local_name.unwrap_or_default();
            let address = peripheral.address().to_string();

            let matches = match target {
                Some(t) => name.contains(t) || address.contains(t),
                None => looks_like_bean(&name, &props.services),
            };

            if matches {
                log::info!("found {} ({})", name, address);
                adapter.stop_scan().await?;
                return Ok(peripheral);
            }
        }
    }

    adapter.stop_scan().await?;
    Err(TransportError::DeviceNotFound)
}

/// [`GattTransport`] for one btleplug peripheral
pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Peripheral,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            peripheral,
            forwarder: Mutex::new(None),
        })
    }

    pub fn address(&self) -> String {
        self.peripheral.address().to_string()
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        self.peripheral.connect().await?;

        let mut notifications = self.peripheral.notifications().await?;
        let mut central = self.adapter.events().await?;
        let id = self.peripheral.id();

        // Forward notifications until the peripheral goes away
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) => {
                            let event = LinkEvent::Notification {
                                characteristic: n.uuid,
                                value: n.value,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = events.send(LinkEvent::Disconnected);
                            break;
                        }
                    },
                    event = central.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            let _ = events.send(LinkEvent::Disconnected);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        if let Some(previous) = self.forwarder.lock().await.replace(forwarder) {
            previous.abort();
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.into_iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn write(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral
            .write(&characteristic, &value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Waits for a known peripheral to advertise again
pub struct BtleplugDiscovery {
    adapter: Adapter,
    address: String,
    timeout: Duration,
}

impl BtleplugDiscovery {
    pub fn new(adapter: Adapter, address: String, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            address,
            timeout,
        })
    }
}

#[async_trait]
impl Discovery for BtleplugDiscovery {
    async fn rediscover(&self) -> Result<(), TransportError> {
        log::info!("scanning for {}", self.address);
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let wait = async {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    continue;
                };
                if peripheral.address().to_string() == self.address {
                    return Ok(());
                }
            }
            Err(TransportError::DeviceNotFound)
        };

        let result = tokio::time::timeout(self.timeout, wait)
            .await
            .unwrap_or(Err(TransportError::DeviceNotFound));
        self.adapter.stop_scan().await?;
        result
    }
}
