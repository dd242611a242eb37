//! Error types for the BLE power station client
//!
//! This module defines the crate-wide error enum and result alias. Protocol,
//! handshake and cipher failures each have their own variant so callers can
//! distinguish a device-reported exception (no point retrying) from a
//! transport fault (retry at the caller's discretion).

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug, Clone)]
pub enum BleError {
    /// Malformed caller input (odd data length, zero count, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A computed frame exceeds the 20-byte GATT MTU
    #[error("Packet too large: {size} bytes exceeds MTU of {mtu}")]
    PacketTooLarge { size: usize, mtu: usize },

    /// OS-signalled loss of the GATT link during an operation
    #[error("Disconnected")]
    Disconnected,

    /// Deadline expired at a suspension point
    #[error("Operation timed out")]
    Timeout,

    /// Explicit abort token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A second operation started while one was in flight
    #[error("Request already in flight")]
    Concurrency,

    /// CRC mismatch, truncation, wrong function code or wrong length
    #[error("Checksum error: {0}")]
    Checksum(String),

    /// Device-reported Modbus exception, surfaced verbatim
    #[error("MODBUS exception: {0}")]
    ModbusException(u8),

    /// Handshake message framing violation (prefix, length, checksum)
    #[error("Handshake format error: {0}")]
    HandshakeFormat(String),

    /// Handshake message out of order for the current role/phase
    #[error("Handshake sequence error: {0}")]
    HandshakeSequence(String),

    /// Handshake signature verification failure
    #[error("Handshake authentication failed: {0}")]
    HandshakeAuth(String),

    /// Peer rejected the challenge or key exchange
    #[error("Handshake rejected by peer")]
    HandshakeRejected,

    /// Encrypted frame framing violation
    #[error("Cipher format error: {0}")]
    CipherFormat(String),

    /// Underlying decrypt failure
    #[error("Cipher authentication failed: {0}")]
    CipherAuth(String),

    /// Configuration loading or key material errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/output errors
    #[error("IO error: {0}")]
    Io(String),

    /// Transport layer errors not covered by a more specific variant
    #[error("Transport error: {0}")]
    Transport(String),

    /// Result store errors
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for this crate
pub type BleResult<T> = std::result::Result<T, BleError>;

impl From<std::io::Error> for BleError {
    fn from(err: std::io::Error) -> Self {
        BleError::Io(err.to_string())
    }
}

impl From<figment::Error> for BleError {
    fn from(err: figment::Error) -> Self {
        BleError::Config(err.to_string())
    }
}

impl From<hex::FromHexError> for BleError {
    fn from(err: hex::FromHexError) -> Self {
        BleError::Config(format!("invalid hex: {err}"))
    }
}

// Helper methods for creating errors
impl BleError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        BleError::InvalidArgument(msg.into())
    }

    pub fn checksum(msg: impl Into<String>) -> Self {
        BleError::Checksum(msg.into())
    }

    pub fn handshake_format(msg: impl Into<String>) -> Self {
        BleError::HandshakeFormat(msg.into())
    }

    pub fn handshake_sequence(msg: impl Into<String>) -> Self {
        BleError::HandshakeSequence(msg.into())
    }

    pub fn handshake_auth(msg: impl Into<String>) -> Self {
        BleError::HandshakeAuth(msg.into())
    }

    pub fn cipher_format(msg: impl Into<String>) -> Self {
        BleError::CipherFormat(msg.into())
    }

    pub fn cipher_auth(msg: impl Into<String>) -> Self {
        BleError::CipherAuth(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BleError::Config(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BleError::Transport(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        BleError::Storage(msg.into())
    }

    /// Whether retrying the same request could plausibly succeed.
    ///
    /// Device exceptions and handshake failures are terminal; transport
    /// faults are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BleError::Timeout
                | BleError::Checksum(_)
                | BleError::Disconnected
                | BleError::Transport(_)
        )
    }
}

/// Extension trait for adding context to foreign errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> BleResult<T>;
    fn transport_error(self, msg: &str) -> BleResult<T>;
    fn storage_error(self, msg: &str) -> BleResult<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> BleResult<T> {
        self.map_err(|e| BleError::Config(format!("{msg}: {e}")))
    }

    fn transport_error(self, msg: &str) -> BleResult<T> {
        self.map_err(|e| BleError::Transport(format!("{msg}: {e}")))
    }

    fn storage_error(self, msg: &str) -> BleResult<T> {
        self.map_err(|e| BleError::Storage(format!("{msg}: {e}")))
    }
}
