//! CRC-16/MODBUS checksum
//!
//! Polynomial 0xA001 (reflected), initial value 0xFFFF, no final XOR. The
//! checksum is appended little-endian to every frame.

use crc::{Crc, CRC_16_MODBUS};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the CRC-16/MODBUS checksum of `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Append the little-endian CRC of the current contents to `frame`
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing little-endian CRC of a complete frame
///
/// Frames shorter than the two CRC bytes themselves fail the check.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    crc16(&frame[..data_len]) == received
}
