//! BLE transport layer for DFU communication.
//!
//! Provides a trait-based abstraction over the platform BLE stack,
//! enabling both real hardware and simulated bootloaders in tests.
//!
//! The boundary is deliberately small: observe advertisements, connect,
//! write a characteristic, subscribe to notifications, disconnect. Reading
//! a characteristic is used only to identify the device mode.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::TransportError;

/// One advertisement report as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Advertised local name, if the packet carried one.
    pub name: Option<String>,
    /// MAC address (or platform UUID where the stack hides addresses).
    pub address: String,
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the advertisement.
    #[serde(default)]
    pub services: Vec<Uuid>,
}

/// Trait for the BLE central side of DFU.
///
/// Implementations deliver advertisements in the order the stack reports
/// them and keep one scan running at a time.
pub trait BleTransport: Send + Sync {
    type Connection: BleConnection;

    /// Start observing advertisements.
    ///
    /// Reports are pushed into the returned channel until `stop_scan` is
    /// called.
    fn start_scan(
        &self,
    ) -> impl Future<Output = Result<mpsc::Receiver<Advertisement>, TransportError>> + Send;

    /// Stop observing advertisements and release the scan.
    fn stop_scan(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Connect to a peripheral and discover its services.
    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// Trait for an open connection to one peripheral.
pub trait BleConnection: Send + Sync {
    /// Write a characteristic, with or without a link-layer response.
    fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Read a characteristic value.
    fn read(
        &self,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Enable notifications on a characteristic.
    ///
    /// Notifications are delivered in the order the device sent them. The
    /// channel closes when the link drops.
    fn subscribe(
        &self,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>> + Send;

    /// Close the link.
    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
