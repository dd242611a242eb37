//! Modbus frame construction and response validation
//!
//! Builds the three request frames the power station understands (FC03,
//! FC06, FC16) and validates responses in a fixed order: truncation, CRC,
//! exception bit, function code, length.

use tracing::trace;

use crate::constants::{
    read_response_size, write_multiple_size, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_REGISTER, GATT_MTU, MAX_WRITE_DATA_BYTES, SLAVE_ADDRESS,
};
use crate::error::{BleError, BleResult};
use crate::pdu::ModbusFrame;
use crate::utils::format_hex_pretty;

/// Modbus codec for request framing and response parsing
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build a Read Holding Registers (FC03) request
    ///
    /// The quantity is capped by the response fitting the GATT MTU, not by
    /// the classic 125-register PDU limit.
    pub fn build_read_holding(address: u16, quantity: u16) -> BleResult<ModbusFrame> {
        if quantity == 0 {
            return Err(BleError::invalid_argument("register count must be > 0"));
        }
        let response_size = read_response_size(quantity);
        if response_size > GATT_MTU {
            return Err(BleError::PacketTooLarge {
                size: response_size,
                mtu: GATT_MTU,
            });
        }

        let mut frame = ModbusFrame::new();
        frame.push(SLAVE_ADDRESS)?;
        frame.push(FC_READ_HOLDING_REGISTERS)?;
        frame.push_u16(address)?;
        frame.push_u16(quantity)?;
        frame.push_crc()?;

        trace!("FC03 request: {}", format_hex_pretty(frame.as_slice()));
        Ok(frame)
    }

    /// Build a Write Single Register (FC06) request
    pub fn build_write_single(address: u16, value: [u8; 2]) -> BleResult<ModbusFrame> {
        let mut frame = ModbusFrame::new();
        frame.push(SLAVE_ADDRESS)?;
        frame.push(FC_WRITE_SINGLE_REGISTER)?;
        frame.push_u16(address)?;
        frame.extend(&value)?;
        frame.push_crc()?;

        trace!("FC06 request: {}", format_hex_pretty(frame.as_slice()));
        Ok(frame)
    }

    /// Build a Write Multiple Registers (FC16) request
    pub fn build_write_multiple(address: u16, data: &[u8]) -> BleResult<ModbusFrame> {
        if data.is_empty() {
            return Err(BleError::invalid_argument("write data must not be empty"));
        }
        if data.len() % 2 != 0 {
            return Err(BleError::invalid_argument(format!(
                "write data length must be even, got {}",
                data.len()
            )));
        }
        let command_size = write_multiple_size(data.len());
        if command_size > GATT_MTU || data.len() > MAX_WRITE_DATA_BYTES {
            return Err(BleError::PacketTooLarge {
                size: command_size,
                mtu: GATT_MTU,
            });
        }

        let quantity = (data.len() / 2) as u16;
        let mut frame = ModbusFrame::new();
        frame.push(SLAVE_ADDRESS)?;
        frame.push(FC_WRITE_MULTIPLE_REGISTERS)?;
        frame.push_u16(address)?;
        frame.push_u16(quantity)?;
        frame.push(data.len() as u8)?;
        frame.extend(data)?;
        frame.push_crc()?;

        trace!("FC16 request: {}", format_hex_pretty(frame.as_slice()));
        Ok(frame)
    }

    /// Expected size of a complete response to the given request
    pub fn expected_response_size(request: &ModbusFrame) -> usize {
        match request.function_code() {
            Some(FC_READ_HOLDING_REGISTERS) => {
                let qty = u16::from_be_bytes([request.as_slice()[4], request.as_slice()[5]]);
                read_response_size(qty)
            }
            // FC06 echoes the request, FC16 answers with address + quantity
            _ => 8,
        }
    }

    /// Validate a response frame and extract its payload
    ///
    /// Validation order: truncation, CRC, exception bit, function code,
    /// length. Truncation and any framing inconsistency surface as
    /// [`BleError::Checksum`]; device exceptions as
    /// [`BleError::ModbusException`].
    ///
    /// The recovered payload is the register data for FC03, the value bytes
    /// for FC06 and the address/quantity echo for FC16.
    pub fn parse_response(
        response: &[u8],
        request_fc: u8,
        expected_size: usize,
    ) -> BleResult<Vec<u8>> {
        if response.len() < 3 {
            return Err(BleError::checksum(format!(
                "response truncated: {} bytes",
                response.len()
            )));
        }

        if !crate::crc::verify_crc(response) {
            return Err(BleError::checksum(format!(
                "CRC mismatch in response: {}",
                format_hex_pretty(response)
            )));
        }

        let function = response[1];
        if function & 0x80 != 0 {
            let code = response[2];
            trace!(
                "device exception {:02X}: {}",
                code,
                crate::constants::exception_description(code)
            );
            return Err(BleError::ModbusException(code));
        }

        if function != request_fc {
            return Err(BleError::checksum(format!(
                "function code mismatch: expected {:02X}, got {:02X}",
                request_fc, function
            )));
        }

        if response.len() != expected_size {
            return Err(BleError::checksum(format!(
                "unexpected response length: expected {}, got {}",
                expected_size,
                response.len()
            )));
        }

        let payload = match function {
            FC_READ_HOLDING_REGISTERS => response[3..response.len() - 2].to_vec(),
            FC_WRITE_SINGLE_REGISTER => response[4..6].to_vec(),
            FC_WRITE_MULTIPLE_REGISTERS => response[2..6].to_vec(),
            other => {
                return Err(BleError::checksum(format!(
                    "unsupported function code {other:02X}"
                )))
            }
        };

        Ok(payload)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::crc::append_crc;

    fn response(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        append_crc(&mut frame);
        frame
    }

    // ---------- Request construction ----------

    #[test]
    fn test_build_read_holding() {
        let frame = ModbusCodec::build_read_holding(0x000A, 3).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame.as_slice()[..6], &[0x01, 0x03, 0x00, 0x0A, 0x00, 0x03]);
        assert!(crate::crc::verify_crc(frame.as_slice()));
    }

    #[test]
    fn test_build_read_zero_count_rejected() {
        let err = ModbusCodec::build_read_holding(0, 0).unwrap_err();
        assert!(matches!(err, BleError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_read_eight_registers_too_large() {
        // 8 registers would need a 21-byte response
        let err = ModbusCodec::build_read_holding(0, 8).unwrap_err();
        assert!(matches!(
            err,
            BleError::PacketTooLarge { size: 21, mtu: 20 }
        ));
    }

    #[test]
    fn test_build_write_single() {
        let frame = ModbusCodec::build_write_single(0x0032, [0xAB, 0xCD]).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame.as_slice()[..6], &[0x01, 0x06, 0x00, 0x32, 0xAB, 0xCD]);
        assert!(crate::crc::verify_crc(frame.as_slice()));
    }

    #[test]
    fn test_build_write_multiple() {
        let frame = ModbusCodec::build_write_multiple(0x0100, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(
            &frame.as_slice()[..9],
            &[0x01, 0x10, 0x01, 0x00, 0x00, 0x02, 0x04, 0x11, 0x22]
        );
        assert!(crate::crc::verify_crc(frame.as_slice()));
    }

    #[test]
    fn test_build_write_odd_length_rejected() {
        let err = ModbusCodec::build_write_multiple(0, &[0x01, 0x02, 0x03]).unwrap_err();
        assert!(matches!(err, BleError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_write_empty_rejected() {
        let err = ModbusCodec::build_write_multiple(0, &[]).unwrap_err();
        assert!(matches!(err, BleError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_write_twelve_bytes_too_large() {
        // 12 data bytes would give a 21-byte command frame
        let err = ModbusCodec::build_write_multiple(0, &[0u8; 12]).unwrap_err();
        assert!(matches!(err, BleError::PacketTooLarge { .. }));
    }

    // ---------- Response parsing ----------

    #[test]
    fn test_parse_read_response() {
        let rsp = response(&[0x01, 0x03, 0x06, 0x00, 0x64, 0x00, 0xC8, 0x01, 0x2C]);
        let payload = ModbusCodec::parse_response(&rsp, 0x03, rsp.len()).unwrap();
        assert_eq!(payload, vec![0x00, 0x64, 0x00, 0xC8, 0x01, 0x2C]);
    }

    #[test]
    fn test_parse_write_single_echo() {
        let rsp = response(&[0x01, 0x06, 0x00, 0x32, 0xAB, 0xCD]);
        let payload = ModbusCodec::parse_response(&rsp, 0x06, 8).unwrap();
        assert_eq!(payload, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_parse_write_multiple_echo() {
        let rsp = response(&[0x01, 0x10, 0x01, 0x00, 0x00, 0x02]);
        let payload = ModbusCodec::parse_response(&rsp, 0x10, 8).unwrap();
        assert_eq!(payload, vec![0x01, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_parse_exception_response() {
        let rsp = response(&[0x01, 0x83, 0x02]);
        let err = ModbusCodec::parse_response(&rsp, 0x03, 11).unwrap_err();
        assert!(matches!(err, BleError::ModbusException(2)));
    }

    #[test]
    fn test_parse_crc_mismatch() {
        let mut rsp = response(&[0x01, 0x03, 0x02, 0x00, 0x64]);
        rsp[3] ^= 0xFF;
        let err = ModbusCodec::parse_response(&rsp, 0x03, rsp.len()).unwrap_err();
        assert!(matches!(err, BleError::Checksum(_)));
    }

    #[test]
    fn test_parse_truncated_is_checksum() {
        let err = ModbusCodec::parse_response(&[0x01, 0x03], 0x03, 7).unwrap_err();
        assert!(matches!(err, BleError::Checksum(_)));
    }

    #[test]
    fn test_parse_function_code_mismatch() {
        let rsp = response(&[0x01, 0x06, 0x00, 0x32, 0xAB, 0xCD]);
        let err = ModbusCodec::parse_response(&rsp, 0x03, 8).unwrap_err();
        match err {
            BleError::Checksum(msg) => assert!(msg.contains("mismatch")),
            other => panic!("expected Checksum, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_wrong_length() {
        // Valid CRC and function code, but one register short of the request
        let rsp = response(&[0x01, 0x03, 0x02, 0x00, 0x64]);
        let err = ModbusCodec::parse_response(&rsp, 0x03, 9).unwrap_err();
        assert!(matches!(err, BleError::Checksum(_)));
    }

    #[test]
    fn test_expected_response_size() {
        let read = ModbusCodec::build_read_holding(0, 3).unwrap();
        assert_eq!(ModbusCodec::expected_response_size(&read), 11);

        let write = ModbusCodec::build_write_single(0, [0, 1]).unwrap();
        assert_eq!(ModbusCodec::expected_response_size(&write), 8);

        let write = ModbusCodec::build_write_multiple(0, &[0, 1, 2, 3]).unwrap();
        assert_eq!(ModbusCodec::expected_response_size(&write), 8);
    }

    #[test]
    fn test_crc_roundtrip_law() {
        // Every produced frame carries its own valid little-endian CRC
        for qty in 1..=7u16 {
            let frame = ModbusCodec::build_read_holding(qty * 100, qty).unwrap();
            let bytes = frame.as_slice();
            let crc = crate::crc::crc16(&bytes[..bytes.len() - 2]);
            assert_eq!(
                crc,
                u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]])
            );
        }
    }
}
