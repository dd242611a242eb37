//! # Voltage BLE - Power Station Register Discovery
//!
//! A Bluetooth Low Energy Modbus client for consumer power stations, built
//! around discovering which 16-bit holding registers a device answers to and
//! what they contain.
//!
//! ## Features
//!
//! - **Modbus over GATT**: FC03/FC06/FC16 framing with CRC-16 validation,
//!   sized for the 20-byte BLE payload
//! - **Optional encryption**: auto-detected six-state handshake combining a
//!   shared-secret challenge with an ECDH exchange of signed P-256 keys
//! - **Single-flight client**: one request in flight, deadline-raced
//!   suspension points, reconnect-on-demand
//! - **Adaptive scanner**: bisecting readability probe that localizes
//!   unreadable registers in logarithmic extra reads and resumes across
//!   sessions
//! - **In-process mock**: a complete mock station with failure injection for
//!   testing without hardware
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client |
//! |------|----------|--------|
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_ble::{
//!     BleResult, MemoryResultStore, MockStation, RegisterScanner, ScanRange, StationClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> BleResult<()> {
//!     // A mock stands in for a real GATT peripheral here
//!     let device = MockStation::plaintext();
//!     let client = Arc::new(StationClient::new(Box::new(device), None));
//!
//!     client.connect(None).await?;
//!     let bytes = client.read_registers(0, 3, None).await?;
//!     println!("registers 0..3: {bytes:02X?}");
//!
//!     // Discover the whole register map
//!     let store = Arc::new(MemoryResultStore::new());
//!     let ranges = [ScanRange::new(0, 100)?];
//!     let mut scanner = RegisterScanner::new(client.clone(), &ranges, store);
//!     scanner.run(None).await?;
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Protocol constants for the BLE power station link
pub mod constants;

/// CRC-16/MODBUS checksum
pub mod crc;

/// Fixed-size Modbus frame buffer
pub mod pdu;

/// Modbus frame construction and response validation
pub mod codec;

// ============================================================================
// Session cryptography
// ============================================================================

/// AES-CBC transport codec with MD5-derived IVs
pub mod cipher;

/// Key bundle handling
pub mod keys;

/// Six-state encryption handshake
pub mod handshake;

// ============================================================================
// Transport and client
// ============================================================================

/// GATT transport abstraction
pub mod transport;

/// BLE power station client
pub mod client;

/// In-process mock power station
pub mod mock;

// ============================================================================
// Discovery
// ============================================================================

/// Adaptive register scanner
pub mod scanner;

/// Scan result persistence
pub mod store;

// ============================================================================
// Ambient services
// ============================================================================

/// Client configuration
pub mod config;

/// Tracing initialisation
pub mod logging;

/// Hex formatting utilities
pub mod utils;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use cipher::CipherKey;
pub use client::StationClient;
pub use codec::ModbusCodec;
pub use config::{ClientConfig, KeyBundleConfig, LogConfig};
pub use constants::{
    DEFAULT_TIMEOUT_MS, ENCRYPTION_WINDOW_MS, GATT_MTU, MAX_REGISTERS_PER_READ,
    NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, SLAVE_ADDRESS, WRITE_CHARACTERISTIC_UUID,
};
pub use error::{BleError, BleResult};
pub use handshake::{Handshake, HandshakeRole, HandshakeState};
pub use keys::KeyBundle;
pub use mock::{FailureInjection, MockStation, MockStationConfig};
pub use pdu::ModbusFrame;
pub use scanner::{
    calculate_pending_ranges, default_range, RegisterScanner, ScanProgress, ScanRange,
};
pub use store::{DeviceRecord, MemoryResultStore, RegisterScanResult, ResultStore};
pub use transport::{GattTransport, LinkStats, TransportError, TransportEvent};
