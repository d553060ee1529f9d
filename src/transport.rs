//! BLE transport layer.
//!
//! The daemon talks to peripherals through the small [`BleTransport`] /
//! [`BleConnection`] seam so the orchestrator and driver can be exercised
//! against in-process fakes. The production implementation rides on
//! `btleplug` and the standard Nordic UART service: commands are written
//! without response to the RX characteristic and notifications stream from
//! the TX characteristic into the driver's sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use thiserror::Error;
use uuid::Uuid;

/// Nordic UART service and characteristic UUIDs.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_RX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_TX_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// How long `connect` will scan for a peripheral that is not already known
/// to the adapter.
const CONNECT_SCAN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not found")]
    NotFound,
    #[error("characteristic missing: {0}")]
    CharacteristicMissing(&'static str),
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("{0}")]
    Io(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> TransportError {
        match err {
            btleplug::Error::DeviceNotFound => TransportError::NotFound,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// A device seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Callback receiving raw notification payloads from the TX characteristic.
pub type NotificationSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Scanning and connecting. One implementation per backend; the daemon holds
/// it as a trait object.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Scan for advertising peripherals for the given duration.
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError>;

    /// Resolve a single peripheral by address, scanning if necessary.
    async fn resolve(&self, address: &str) -> Result<DiscoveredDevice, TransportError>;

    /// Connect, resolve the UART characteristics, subscribe notifications
    /// into `sink`, and return a live connection.
    async fn connect(
        &self,
        address: &str,
        sink: NotificationSink,
    ) -> Result<Box<dyn BleConnection>, TransportError>;
}

/// A live link to one peripheral.
#[async_trait]
pub trait BleConnection: Send + Sync {
    /// Write one frame to the UART RX characteristic without response.
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Unsubscribe and close the link. Idempotent.
    async fn close(&self);

    async fn is_connected(&self) -> bool;
}

/// `btleplug`-backed transport using the first available adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
}

impl BtleplugTransport {
    /// Grab the first Bluetooth adapter on the host.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::AdapterUnavailable("no bluetooth adapters found".to_string())
            })?;
        Ok(BtleplugTransport { adapter })
    }

    async fn known_peripheral(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.known_peripheral(address).await? {
            return Ok(peripheral);
        }
        // Not cached by the adapter yet; scan briefly and retry.
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(CONNECT_SCAN_TIMEOUT).await;
        self.adapter.stop_scan().await?;
        self.known_peripheral(address)
            .await?
            .ok_or(TransportError::NotFound)
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        self.adapter.stop_scan().await?;

        let mut discovered = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|props| props.local_name);
            discovered.push(DiscoveredDevice {
                address: peripheral.address().to_string(),
                name,
            });
        }
        Ok(discovered)
    }

    async fn resolve(&self, address: &str) -> Result<DiscoveredDevice, TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|props| props.local_name);
        Ok(DiscoveredDevice {
            address: peripheral.address().to_string(),
            name,
        })
    }

    async fn connect(
        &self,
        address: &str,
        sink: NotificationSink,
    ) -> Result<Box<dyn BleConnection>, TransportError> {
        let peripheral = self.find_peripheral(address).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics = peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == UART_RX_CHAR_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing("UART RX"))?;
        let read_char = characteristics
            .iter()
            .find(|c| c.uuid == UART_TX_CHAR_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing("UART TX"))?;

        peripheral.subscribe(&read_char).await?;
        let mut notifications = peripheral.notifications().await?;
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == UART_TX_CHAR_UUID {
                    sink(notification.value);
                }
            }
        });

        Ok(Box::new(BtleplugConnection {
            peripheral,
            write_char,
            read_char,
            notify_task,
        }))
    }
}

struct BtleplugConnection {
    peripheral: Peripheral,
    write_char: Characteristic,
    read_char: Characteristic,
    notify_task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BleConnection for BtleplugConnection {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.write_char, frame, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.peripheral.unsubscribe(&self.read_char).await {
            tracing::debug!("failed to unsubscribe notifications: {err}");
        }
        if let Err(err) = self.peripheral.disconnect().await {
            tracing::debug!("failed to disconnect: {err}");
        }
        self.notify_task.abort();
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        self.notify_task.abort();
    }
}
