//! Modbus RTU frame building and response validation.
//!
//! Every response is checked against the request that produced it. A frame
//! that fails any check is rejected as a whole; nothing is decoded from it.

use bytes::{BufMut, BytesMut};

use super::crc::{append_crc, frame_crc};
use crate::utils::error::{FrameError, ModbusError};

/// Largest bit count a single read may request.
pub const MAX_READ_BITS: u16 = 2000;
/// Largest register count a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest register count a single 0x10 write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Address + function + byte count + CRC.
const READ_OVERHEAD: usize = 5;
const EXCEPTION_FRAME_LEN: usize = 5;
const WRITE_MULTIPLE_RESPONSE_LEN: usize = 8;
const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { start: u16, count: u16 },
    ReadDiscreteInputs { start: u16, count: u16 },
    ReadHoldingRegisters { start: u16, count: u16 },
    ReadInputRegisters { start: u16, count: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleRegisters { start: u16, values: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
    Written,
}

impl ModbusRequest {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            ModbusRequest::ReadCoils { .. } => FunctionCode::ReadCoils,
            ModbusRequest::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            ModbusRequest::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            ModbusRequest::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            ModbusRequest::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            ModbusRequest::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            ModbusRequest::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Rejects requests the protocol cannot carry, before any I/O happens.
    pub fn validate(&self) -> Result<(), ModbusError> {
        match self {
            ModbusRequest::ReadCoils { start, count }
            | ModbusRequest::ReadDiscreteInputs { start, count } => {
                check_range(*start, *count, MAX_READ_BITS, "bits")
            }
            ModbusRequest::ReadHoldingRegisters { start, count }
            | ModbusRequest::ReadInputRegisters { start, count } => {
                check_range(*start, *count, MAX_READ_REGISTERS, "registers")
            }
            ModbusRequest::WriteMultipleRegisters { start, values } => {
                if values.is_empty() {
                    return Err(ModbusError::InvalidArgument("no values to write".to_string()));
                }
                let count = u16::try_from(values.len()).map_err(|_| {
                    ModbusError::InvalidArgument(format!("too many values: {}", values.len()))
                })?;
                check_range(*start, count, MAX_WRITE_REGISTERS, "registers")
            }
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => {
                Ok(())
            }
        }
    }

    /// Builds the complete RTU frame, CRC included. The request must have
    /// passed [`validate`](Self::validate): counts are not range checked here.
    pub(crate) fn encode(&self, slave: u8) -> Vec<u8> {
        let mut frame = BytesMut::with_capacity(9 + self.payload_len());
        frame.put_u8(slave);
        frame.put_u8(self.function_code().code());

        match self {
            ModbusRequest::ReadCoils { start, count }
            | ModbusRequest::ReadDiscreteInputs { start, count }
            | ModbusRequest::ReadHoldingRegisters { start, count }
            | ModbusRequest::ReadInputRegisters { start, count } => {
                frame.put_u16(*start);
                frame.put_u16(*count);
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                frame.put_u16(*address);
                frame.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                frame.put_u16(*address);
                frame.put_u16(*value);
            }
            ModbusRequest::WriteMultipleRegisters { start, values } => {
                frame.put_u16(*start);
                frame.put_u16(values.len() as u16);
                frame.put_u8((values.len() * 2) as u8);
                for value in values {
                    frame.put_u16(*value);
                }
            }
        }

        let mut frame = frame.to_vec();
        append_crc(&mut frame);
        frame
    }

    fn payload_len(&self) -> usize {
        match self {
            ModbusRequest::WriteMultipleRegisters { values, .. } => values.len() * 2,
            _ => 0,
        }
    }

    /// Validates `response` against this request (already encoded as
    /// `request_frame` for `slave`) and decodes it.
    pub fn decode(
        &self,
        slave: u8,
        request_frame: &[u8],
        response: &[u8],
    ) -> Result<ModbusResponse, FrameError> {
        let function = self.function_code().code();
        if let Some(exception) = exception_reply(slave, function, response) {
            return Err(exception);
        }

        match self {
            ModbusRequest::ReadCoils { count, .. } | ModbusRequest::ReadDiscreteInputs { count, .. } => {
                let byte_count = (*count as usize).div_ceil(8);
                let payload = check_read_frame(slave, function, byte_count, response)?;
                Ok(ModbusResponse::Bits(unpack_bits(payload, *count as usize)))
            }
            ModbusRequest::ReadHoldingRegisters { count, .. }
            | ModbusRequest::ReadInputRegisters { count, .. } => {
                let byte_count = *count as usize * 2;
                let payload = check_read_frame(slave, function, byte_count, response)?;
                Ok(ModbusResponse::Registers(unpack_registers(payload)))
            }
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => {
                if response.len() != request_frame.len() {
                    return Err(FrameError::LengthMismatch {
                        expected: request_frame.len(),
                        actual: response.len(),
                    });
                }
                if response != request_frame {
                    return Err(FrameError::EchoMismatch);
                }
                Ok(ModbusResponse::Written)
            }
            ModbusRequest::WriteMultipleRegisters { start, values } => {
                if response.len() != WRITE_MULTIPLE_RESPONSE_LEN {
                    return Err(FrameError::LengthMismatch {
                        expected: WRITE_MULTIPLE_RESPONSE_LEN,
                        actual: response.len(),
                    });
                }
                check_crc(response)?;
                check_header(slave, function, response)?;
                let echoed_start = u16::from_be_bytes([response[2], response[3]]);
                let echoed_count = u16::from_be_bytes([response[4], response[5]]);
                if echoed_start != *start || echoed_count as usize != values.len() {
                    return Err(FrameError::EchoMismatch);
                }
                Ok(ModbusResponse::Written)
            }
        }
    }
}

fn check_range(start: u16, count: u16, max: u16, what: &str) -> Result<(), ModbusError> {
    if count == 0 {
        return Err(ModbusError::InvalidArgument(format!("{} count must be at least 1", what)));
    }
    if count > max {
        return Err(ModbusError::InvalidArgument(format!(
            "{} count {} exceeds the limit of {}",
            what, count, max
        )));
    }
    if start as u32 + count as u32 > 0x1_0000 {
        return Err(ModbusError::InvalidArgument(format!(
            "{} {} starting at {} run past address 65535",
            count, what, start
        )));
    }
    Ok(())
}

fn check_crc(response: &[u8]) -> Result<(), FrameError> {
    match frame_crc(response) {
        Some((calculated, received)) if calculated == received => Ok(()),
        Some((calculated, received)) => Err(FrameError::CrcMismatch { calculated, received }),
        None => Err(FrameError::TooShort {
            expected: 2,
            actual: response.len(),
        }),
    }
}

fn check_header(slave: u8, function: u8, response: &[u8]) -> Result<(), FrameError> {
    if response[0] != slave {
        return Err(FrameError::AddressMismatch {
            expected: slave,
            actual: response[0],
        });
    }
    if response[1] != function {
        return Err(FrameError::FunctionMismatch {
            expected: function,
            actual: response[1],
        });
    }
    Ok(())
}

/// Checks a read reply and returns its data bytes.
fn check_read_frame(
    slave: u8,
    function: u8,
    byte_count: usize,
    response: &[u8],
) -> Result<&[u8], FrameError> {
    if response.len() < READ_OVERHEAD {
        return Err(FrameError::TooShort {
            expected: READ_OVERHEAD + byte_count,
            actual: response.len(),
        });
    }
    check_crc(response)?;
    check_header(slave, function, response)?;
    if response[2] as usize != byte_count {
        return Err(FrameError::ByteCountMismatch {
            expected: byte_count,
            actual: response[2] as usize,
        });
    }
    if response.len() != READ_OVERHEAD + byte_count {
        return Err(FrameError::LengthMismatch {
            expected: READ_OVERHEAD + byte_count,
            actual: response.len(),
        });
    }
    Ok(&response[3..3 + byte_count])
}

/// A well-formed exception reply from our slave for this function.
fn exception_reply(slave: u8, function: u8, response: &[u8]) -> Option<FrameError> {
    if response.len() != EXCEPTION_FRAME_LEN
        || response[0] != slave
        || response[1] != function | EXCEPTION_FLAG
        || check_crc(response).is_err()
    {
        return None;
    }
    Some(FrameError::Exception {
        function,
        code: response[2],
    })
}

/// LSB first within each byte; bits past `count` are dropped.
pub fn unpack_bits(payload: &[u8], count: usize) -> Vec<bool> {
    payload
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .take(count)
        .collect()
}

/// Two bytes per register, high byte first.
pub fn unpack_registers(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_encode_read_holding_registers() {
        let request = ModbusRequest::ReadHoldingRegisters { start: 0, count: 1 };
        assert_eq!(
            request.encode(0x01),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn test_encode_write_single_coil() {
        let on = ModbusRequest::WriteSingleCoil { address: 0x0002, value: true }.encode(0x10);
        assert_eq!(&on[..6], &[0x10, 0x05, 0x00, 0x02, 0xFF, 0x00]);
        let off = ModbusRequest::WriteSingleCoil { address: 0x0002, value: false }.encode(0x10);
        assert_eq!(&off[..6], &[0x10, 0x05, 0x00, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_write_multiple_registers() {
        let request = ModbusRequest::WriteMultipleRegisters {
            start: 0x000C,
            values: vec![0x0001, 0x86A0],
        };
        let frame = request.encode(0x01);
        assert_eq!(
            &frame[..11],
            &[0x01, 0x10, 0x00, 0x0C, 0x00, 0x02, 0x04, 0x00, 0x01, 0x86, 0xA0]
        );
        assert_eq!(frame.len(), 13);
    }

    #[test]
    fn test_decode_coils_bit_order() {
        let request = ModbusRequest::ReadCoils { start: 0, count: 10 };
        let frame = request.encode(1);
        let response = with_crc(vec![0x01, 0x01, 0x02, 0b1011_0010, 0b0000_0001]);

        let decoded = request.decode(1, &frame, &response).unwrap();
        assert_eq!(
            decoded,
            ModbusResponse::Bits(vec![false, true, false, false, true, true, false, true, true, false])
        );
    }

    #[test]
    fn test_decode_discrete_inputs_single_bit() {
        let request = ModbusRequest::ReadDiscreteInputs { start: 1, count: 1 };
        let frame = request.encode(7);
        let response = with_crc(vec![0x07, 0x02, 0x01, 0x01]);
        assert_eq!(
            request.decode(7, &frame, &response).unwrap(),
            ModbusResponse::Bits(vec![true])
        );
    }

    #[test]
    fn test_decode_registers_big_endian() {
        let request = ModbusRequest::ReadInputRegisters { start: 0, count: 2 };
        let frame = request.encode(1);
        let response = with_crc(vec![0x01, 0x04, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
        assert_eq!(
            request.decode(1, &frame, &response).unwrap(),
            ModbusResponse::Registers(vec![0x1234, 0xABCD])
        );
    }

    #[test]
    fn test_any_bit_flip_rejects_frame() {
        let request = ModbusRequest::ReadHoldingRegisters { start: 0, count: 2 };
        let frame = request.encode(1);
        let response = with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x2A, 0xFF, 0x01]);
        assert!(request.decode(1, &frame, &response).is_ok());

        for index in 0..response.len() {
            for bit in 0..8 {
                let mut corrupted = response.clone();
                corrupted[index] ^= 1 << bit;
                assert!(
                    request.decode(1, &frame, &corrupted).is_err(),
                    "flip of bit {} in byte {} was accepted",
                    bit,
                    index
                );
            }
        }
    }

    #[test]
    fn test_decode_rejects_header_mismatches() {
        let request = ModbusRequest::ReadHoldingRegisters { start: 0, count: 1 };
        let frame = request.encode(1);

        let wrong_address = with_crc(vec![0x02, 0x03, 0x02, 0x00, 0x01]);
        assert!(matches!(
            request.decode(1, &frame, &wrong_address),
            Err(FrameError::AddressMismatch { expected: 1, actual: 2 })
        ));

        let wrong_function = with_crc(vec![0x01, 0x04, 0x02, 0x00, 0x01]);
        assert!(matches!(
            request.decode(1, &frame, &wrong_function),
            Err(FrameError::FunctionMismatch { .. })
        ));

        let wrong_count = with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        assert!(matches!(
            request.decode(1, &frame, &wrong_count),
            Err(FrameError::ByteCountMismatch { expected: 2, actual: 4 })
        ));

        assert!(matches!(
            request.decode(1, &frame, &[0x01, 0x03]),
            Err(FrameError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let request = ModbusRequest::ReadHoldingRegisters { start: 0, count: 2 };
        let frame = request.encode(1);
        // Byte count says 4 but only 2 data bytes are present
        let response = with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x01]);
        assert!(request.decode(1, &frame, &response).is_err());
    }

    #[test]
    fn test_decode_exception_reply() {
        let request = ModbusRequest::ReadHoldingRegisters { start: 0x0100, count: 1 };
        let frame = request.encode(1);
        let response = with_crc(vec![0x01, 0x83, 0x02]);
        assert_eq!(
            request.decode(1, &frame, &response),
            Err(FrameError::Exception { function: 0x03, code: 0x02 })
        );
    }

    #[test]
    fn test_write_single_register_echo() {
        let request = ModbusRequest::WriteSingleRegister { address: 0x0005, value: 0x0011 };
        let frame = request.encode(1);
        assert_eq!(request.decode(1, &frame, &frame), Ok(ModbusResponse::Written));

        let mut altered = frame.clone();
        altered[5] = 0x12;
        assert_eq!(request.decode(1, &frame, &altered), Err(FrameError::EchoMismatch));

        let mut bad_crc = frame.clone();
        bad_crc[7] ^= 0x01;
        assert_eq!(request.decode(1, &frame, &bad_crc), Err(FrameError::EchoMismatch));

        assert!(matches!(
            request.decode(1, &frame, &frame[..6]),
            Err(FrameError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_write_multiple_registers_response() {
        let request = ModbusRequest::WriteMultipleRegisters {
            start: 0x0010,
            values: vec![0x0000, 0x03E8],
        };
        let frame = request.encode(1);

        let ok = with_crc(vec![0x01, 0x10, 0x00, 0x10, 0x00, 0x02]);
        assert_eq!(request.decode(1, &frame, &ok), Ok(ModbusResponse::Written));

        let wrong_start = with_crc(vec![0x01, 0x10, 0x00, 0x11, 0x00, 0x02]);
        assert_eq!(request.decode(1, &frame, &wrong_start), Err(FrameError::EchoMismatch));

        let wrong_count = with_crc(vec![0x01, 0x10, 0x00, 0x10, 0x00, 0x01]);
        assert_eq!(request.decode(1, &frame, &wrong_count), Err(FrameError::EchoMismatch));

        let mut too_long = ok.clone();
        too_long.push(0x00);
        assert!(matches!(
            request.decode(1, &frame, &too_long),
            Err(FrameError::LengthMismatch { expected: 8, actual: 9 })
        ));
    }

    #[test]
    fn test_validate_rejects_misuse() {
        assert!(ModbusRequest::ReadHoldingRegisters { start: 0, count: 0 }.validate().is_err());
        assert!(ModbusRequest::ReadHoldingRegisters { start: 0, count: 126 }.validate().is_err());
        assert!(ModbusRequest::ReadHoldingRegisters { start: 0, count: 125 }.validate().is_ok());
        assert!(ModbusRequest::ReadCoils { start: 0, count: 2001 }.validate().is_err());
        assert!(ModbusRequest::ReadCoils { start: 0xFFFF, count: 2 }.validate().is_err());
        assert!(ModbusRequest::WriteMultipleRegisters { start: 0, values: vec![] }
            .validate()
            .is_err());
        assert!(ModbusRequest::WriteMultipleRegisters { start: 0, values: vec![0; 124] }
            .validate()
            .is_err());

        let err = ModbusRequest::ReadInputRegisters { start: 0, count: 0 }
            .validate()
            .unwrap_err();
        assert!(err.is_caller_error());
    }

    #[test]
    fn test_unpack_bits_stops_at_count() {
        assert_eq!(unpack_bits(&[0xFF, 0xFF], 3), vec![true, true, true]);
        assert_eq!(unpack_bits(&[0x01], 8).len(), 8);
        assert!(unpack_bits(&[], 4).is_empty());
    }
}
