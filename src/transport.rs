//! GATT transport abstraction
//!
//! The client talks to the power station through two characteristics: a
//! write-with-response command channel and a notify response channel. This
//! module defines the trait boundary so the protocol engine can run against
//! the OS bluetooth stack or the in-process mock unchanged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Write operation failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Subscription to notifications failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Required service or characteristic missing
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),
}

impl From<TransportError> for crate::error::BleError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionLost(_) => crate::error::BleError::Disconnected,
            other => crate::error::BleError::Transport(other.to_string()),
        }
    }
}

/// Events surfaced by the notify characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification payload arrived
    Notification(Vec<u8>),
    /// The OS signalled loss of the GATT link
    Disconnected,
}

/// Link statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Requests written to the command characteristic
    pub requests_sent: u64,
    /// Responses received and validated
    pub responses_received: u64,
    /// Requests that expired at the deadline
    pub timeouts: u64,
    /// Requests that failed for any other reason
    pub errors: u64,
    /// Reconnections performed on demand
    pub reconnects: u64,
    /// Total bytes written
    pub bytes_sent: u64,
    /// Total notification bytes received
    pub bytes_received: u64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self, bytes: usize) {
        self.requests_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_response(&mut self, bytes: usize) {
        self.responses_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }
}

/// A GATT link to one power station
///
/// Implementations own the OS device handle. `connect` acquires GATT,
/// resolves the service and both characteristics; `subscribe` enables
/// notifications and hands back the event stream. The handle survives
/// disconnects so the client can reconnect without re-selection.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Stable device identifier (peripheral address or platform id)
    fn id(&self) -> &str;

    /// Advertised device name
    fn name(&self) -> &str;

    /// Acquire GATT and resolve the service and characteristics
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Drop GATT; the device handle is retained
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Enable notifications and return the event stream
    ///
    /// A fresh receiver is handed out per connection; an OS disconnect must
    /// surface as [`TransportEvent::Disconnected`] on the stream.
    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Write one command with response
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Whether GATT is currently held
    async fn is_connected(&self) -> bool;
}

#[cfg(feature = "btleplug")]
pub mod btle {
    //! GATT transport over the `btleplug` cross-platform bluetooth stack

    use super::{GattTransport, TransportError, TransportEvent};
    use crate::constants::{NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
    use async_trait::async_trait;
    use btleplug::api::{Characteristic, Peripheral as _, WriteType};
    use btleplug::platform::Peripheral;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tracing::debug;

    /// [`GattTransport`] over a `btleplug` peripheral
    pub struct BtlePeripheral {
        peripheral: Peripheral,
        id: String,
        name: String,
        write_char: Option<Characteristic>,
        notify_char: Option<Characteristic>,
    }

    impl BtlePeripheral {
        /// Wrap an already-discovered peripheral
        pub async fn new(peripheral: Peripheral) -> Self {
            let id = peripheral.id().to_string();
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name)
                .unwrap_or_else(|| id.clone());
            Self {
                peripheral,
                id,
                name,
                write_char: None,
                notify_char: None,
            }
        }

        fn find_characteristic(
            &self,
            uuid: uuid::Uuid,
        ) -> Result<Characteristic, TransportError> {
            self.peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == uuid)
                .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
        }
    }

    #[async_trait]
    impl GattTransport for BtlePeripheral {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&mut self) -> Result<(), TransportError> {
            self.peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            self.peripheral
                .discover_services()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            self.write_char = Some(self.find_characteristic(WRITE_CHARACTERISTIC_UUID)?);
            self.notify_char = Some(self.find_characteristic(NOTIFY_CHARACTERISTIC_UUID)?);
            debug!("connected to {} ({})", self.name, self.id);
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            self.write_char = None;
            self.notify_char = None;
            self.peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))
        }

        async fn subscribe(
            &mut self,
        ) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
            let notify = self
                .notify_char
                .clone()
                .ok_or_else(|| TransportError::SubscribeFailed("not connected".into()))?;
            self.peripheral
                .subscribe(&notify)
                .await
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

            let mut stream = self
                .peripheral
                .notifications()
                .await
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    if notification.uuid == NOTIFY_CHARACTERISTIC_UUID
                        && tx.send(TransportEvent::Notification(notification.value)).is_err()
                    {
                        break;
                    }
                }
                // Stream end means the link is gone
                let _ = tx.send(TransportEvent::Disconnected);
            });
            Ok(rx)
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            let write = self
                .write_char
                .as_ref()
                .ok_or_else(|| TransportError::WriteFailed("not connected".into()))?;
            self.peripheral
                .write(write, data, WriteType::WithResponse)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        }

        async fn is_connected(&self) -> bool {
            self.peripheral.is_connected().await.unwrap_or(false)
        }
    }
}
