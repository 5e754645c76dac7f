//! Bluetooth LE transport built on `btleplug`.
//!
//! Controllers expose one GATT service with a single characteristic that is
//! both written (acknowledged writes) and notified.  Scanning is filtered on
//! that service so unrelated peripherals never show up.
//!
//! # Notifications (for beginners)
//!
//! `btleplug` delivers notifications for *every* subscribed characteristic of
//! a peripheral on one stream.  [`BleChannel::subscribe`] spawns a small task
//! that keeps only the controller characteristic and forwards the raw bytes
//! into a bounded `mpsc` queue, which ends when the peripheral disconnects.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vend_core::Device;

use crate::application::transport::{FrameChannel, Transport, TransportError};

const NOTIFICATION_CAPACITY: usize = 32;

/// Interval between peripheral-list polls while waiting for a named peer.
const DISCOVER_POLL: Duration = Duration::from_millis(200);

fn adapter_err(e: btleplug::Error) -> TransportError {
    TransportError::Adapter(e.to_string())
}

/// Finds and connects to controllers through the first Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl BleTransport {
    /// Opens the first adapter the platform reports.
    ///
    /// # Errors
    ///
    /// [`TransportError::Adapter`] if the Bluetooth service is unavailable or
    /// no adapter is present.
    pub async fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(adapter_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(adapter_err)?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Adapter("no Bluetooth adapter found".into()))?;
        info!(
            adapter = %adapter.adapter_info().await.unwrap_or_default(),
            "bluetooth adapter ready"
        );
        Ok(Self {
            adapter,
            service_uuid,
            characteristic_uuid,
        })
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            services: vec![self.service_uuid],
        }
    }

    /// Named peripherals the adapter currently knows about.
    async fn known_devices(&self) -> Result<Vec<(Device, Peripheral)>, TransportError> {
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(adapter_err)? {
            let Some(props) = peripheral.properties().await.map_err(adapter_err)? else {
                continue;
            };
            let Some(name) = props.local_name else {
                continue;
            };
            let device = Device::new(peripheral.address().to_string(), name);
            found.push((device, peripheral));
        }
        Ok(found)
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop_scan failed");
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(&self, timeout: Duration) -> Result<Vec<Device>, TransportError> {
        self.adapter
            .start_scan(self.scan_filter())
            .await
            .map_err(adapter_err)?;
        tokio::time::sleep(timeout).await;
        let found = self.known_devices().await;
        self.stop_scan().await;

        let devices: Vec<Device> = found?.into_iter().map(|(device, _)| device).collect();
        debug!(count = devices.len(), "scan finished");
        Ok(devices)
    }

    async fn discover(&self, name: &str, timeout: Duration) -> Result<Device, TransportError> {
        self.adapter
            .start_scan(self.scan_filter())
            .await
            .map_err(adapter_err)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            match self.known_devices().await {
                Ok(found) => {
                    if let Some((device, _)) = found.into_iter().find(|(d, _)| d.name == name) {
                        break Ok(device);
                    }
                }
                Err(e) => break Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                break Err(TransportError::DeviceNotFound {
                    name: name.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(DISCOVER_POLL).await;
        };

        self.stop_scan().await;
        result
    }

    async fn connect(&self, device: &Device) -> Result<Box<dyn FrameChannel>, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            address: device.address.clone(),
            reason,
        };

        let peripheral = self
            .known_devices()
            .await?
            .into_iter()
            .find(|(d, _)| d.address == device.address)
            .map(|(_, p)| p)
            .ok_or_else(|| connect_err("peer is no longer advertising".into()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.characteristic_uuid && c.service_uuid == self.service_uuid);
        let Some(characteristic) = characteristic else {
            let _ = peripheral.disconnect().await;
            return Err(connect_err(format!(
                "characteristic {} not found",
                self.characteristic_uuid
            )));
        };

        info!(peer = %device.address, name = %device.name, "connected");
        Ok(Box::new(BleChannel {
            device: device.clone(),
            adapter: self.adapter.clone(),
            peripheral,
            characteristic,
            forwarder: Mutex::new(None),
        }))
    }
}

/// One connected controller.
pub struct BleChannel {
    device: Device,
    adapter: Adapter,
    peripheral: Peripheral,
    characteristic: Characteristic,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl FrameChannel for BleChannel {
    fn peer(&self) -> &Device {
        &self.device
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        match self
            .peripheral
            .write(&self.characteristic, frame, WriteType::WithResponse)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if !self.peripheral.is_connected().await.unwrap_or(false) => {
                debug!(error = %e, "write failed on a dropped link");
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::Write(e.to_string())),
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let subscribe_err = |e: btleplug::Error| TransportError::Subscribe(e.to_string());

        let mut notifications = self.peripheral.notifications().await.map_err(subscribe_err)?;
        let mut adapter_events = self.adapter.events().await.map_err(subscribe_err)?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(subscribe_err)?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let uuid = self.characteristic.uuid;
        let id = self.peripheral.id();
        let address = self.device.address.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else { break };
                        if notification.uuid != uuid {
                            continue;
                        }
                        if tx.send(notification.value).await.is_err() {
                            break;
                        }
                    }
                    event = adapter_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                            warn!(peer = %address, "peer disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        if let Some(previous) = self.forwarder.lock().await.replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(task) = self.forwarder.lock().await.take() {
            task.abort();
        }
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Adapter(e.to_string()))?;
        debug!(peer = %self.device.address, "disconnected");
        Ok(())
    }
}
