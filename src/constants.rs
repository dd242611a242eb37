//! Protocol constants for the BLE power station link
//!
//! The GATT link caps every plaintext Modbus frame at the 20-byte ATT payload
//! of the default 23-byte MTU. All per-request limits below derive from that
//! cap rather than from the classic RS485 PDU budget.

use uuid::{uuid, Uuid};

// ============================================================================
// GATT Service and Characteristics
// ============================================================================

/// Primary service exposed by the power station (16-bit alias 0xFF00)
pub const SERVICE_UUID: Uuid = uuid!("0000ff00-0000-1000-8000-00805f9b34fb");

/// Command characteristic (write with response)
pub const WRITE_CHARACTERISTIC_UUID: Uuid = uuid!("0000ff02-0000-1000-8000-00805f9b34fb");

/// Response characteristic (notify)
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = uuid!("0000ff01-0000-1000-8000-00805f9b34fb");

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Usable GATT payload per write/notification
pub const GATT_MTU: usize = 20;

/// Fixed Modbus slave address used by the device
pub const SLAVE_ADDRESS: u8 = 0x01;

/// Maximum registers per read request
///
/// Read response size is 2*qty + 5 (slave + function + byte count + data +
/// CRC), so qty ≤ (20 - 5) / 2 = 7 registers.
pub const MAX_REGISTERS_PER_READ: u16 = 7;

/// Maximum data bytes per multi-register write
///
/// A 0x10 command frame is 9 + N bytes (slave + function + address + quantity
/// + byte count + data + CRC), so N ≤ 20 - 9 = 11, rounded down to the
/// nearest register boundary.
pub const MAX_WRITE_DATA_BYTES: usize = 10;

// ============================================================================
// Timing
// ============================================================================

/// Default response timeout (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// How long to wait after subscribing for an unsolicited handshake challenge
/// before treating the connection as plaintext
pub const ENCRYPTION_WINDOW_MS: u64 = 500;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

// ============================================================================
// Handshake
// ============================================================================

/// Two-byte prefix of every handshake message
pub const HANDSHAKE_PREFIX: [u8; 2] = [0x2A, 0x2A];

// ============================================================================
// Helper Functions
// ============================================================================

/// Size of a complete read request frame (slave + FC + address + quantity + CRC)
#[inline]
pub const fn read_request_size() -> usize {
    1 + 1 + 2 + 2 + 2
}

/// Expected size of a read response for `quantity` registers
///
/// slave(1) + function(1) + byte count(1) + data(2*qty) + CRC(2)
#[inline]
pub const fn read_response_size(quantity: u16) -> usize {
    2 * quantity as usize + 5
}

/// Size of a complete single-register write frame
#[inline]
pub const fn write_single_size() -> usize {
    1 + 1 + 2 + 2 + 2
}

/// Size of a complete multi-register write frame carrying `data_len` bytes
#[inline]
pub const fn write_multiple_size(data_len: usize) -> usize {
    1 + 1 + 2 + 2 + 1 + data_len + 2
}

/// Human-readable Modbus exception description
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Server device failure",
        0x05 => "Acknowledge",
        0x06 => "Server device busy",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}
