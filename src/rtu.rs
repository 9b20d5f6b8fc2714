//! # Modbus RTU framing
//!
//! Encoding and decoding of RTU application data units:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────┬───────────┐
//! │ slave id │ function │ data (0..252 B)  │ CRC16 LE  │
//! └──────────┴──────────┴──────────────────┴───────────┘
//! ```
//!
//! RTU has no length field. The serial pump cannot block waiting for 3.5
//! characters of silence, so frames are delimited by computing the expected
//! length from the function code as bytes arrive ([`request_frame_len`],
//! [`response_frame_len`]). Silence is only used to throw away a partial frame
//! that never completed ([`frame_gap_ms`]).

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{BusError, BusResult};
use crate::protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse};
use crate::MAX_RTU_FRAME_SIZE;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Exception responses set the top bit of the function code
const EXCEPTION_FLAG: u8 = 0x80;

/// Outcome of inspecting the head of a receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// More bytes are needed before the length is known or reached
    Incomplete,
    /// A frame of this many bytes starts at the head of the buffer
    Complete(usize),
    /// The head of the buffer cannot start a valid frame
    Invalid,
}

/// Calculate CRC-16/MODBUS
pub fn calculate_crc(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Verify the trailing CRC of a complete frame
pub fn check_crc(frame: &[u8]) -> BusResult<()> {
    if frame.len() < 4 {
        return Err(BusError::frame("RTU frame too short"));
    }
    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = calculate_crc(&frame[..data_len]);
    if received != calculated {
        return Err(BusError::crc_mismatch(calculated, received));
    }
    Ok(())
}

fn append_crc(frame: &mut Vec<u8>) {
    let crc = calculate_crc(frame);
    // CRC is little-endian in RTU
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Inter-frame silence (3.5 character times) rounded up to whole milliseconds
///
/// Above 19200 baud the standard fixes the gap at 1750 µs. The control loop
/// clock has millisecond resolution, so the result never drops below 2 ms.
pub fn frame_gap_ms(baud_rate: u32) -> u64 {
    let baud_rate = baud_rate.max(1) as u64;
    // 11 bits per character (start + 8 data + parity/stop + stop)
    let char_time_us = 11_000_000 / baud_rate;
    let gap_us = if baud_rate > 19_200 {
        1750
    } else {
        char_time_us * 35 / 10
    };
    ((gap_us + 999) / 1000).max(2)
}

/// Expected length of the request frame at the head of `buf`
pub fn request_frame_len(buf: &[u8]) -> FrameLen {
    if buf.len() < 2 {
        return FrameLen::Incomplete;
    }
    let len = match buf[1] {
        0x01..=0x06 => 8,
        0x0F | 0x10 => match buf.get(6) {
            Some(&byte_count) => 9 + byte_count as usize,
            None => return FrameLen::Incomplete,
        },
        _ => return FrameLen::Invalid,
    };
    complete_if_available(buf, len)
}

/// Expected length of the response frame at the head of `buf`
pub fn response_frame_len(buf: &[u8]) -> FrameLen {
    if buf.len() < 2 {
        return FrameLen::Incomplete;
    }
    let function = buf[1];
    if function & EXCEPTION_FLAG != 0 {
        return match ModbusFunction::from_u8(function & !EXCEPTION_FLAG) {
            Ok(_) => complete_if_available(buf, 5),
            Err(_) => FrameLen::Invalid,
        };
    }
    let len = match function {
        0x01..=0x04 => match buf.get(2) {
            Some(&byte_count) => 5 + byte_count as usize,
            None => return FrameLen::Incomplete,
        },
        0x05 | 0x06 | 0x0F | 0x10 => 8,
        _ => return FrameLen::Invalid,
    };
    complete_if_available(buf, len)
}

fn complete_if_available(buf: &[u8], len: usize) -> FrameLen {
    if len > MAX_RTU_FRAME_SIZE {
        FrameLen::Invalid
    } else if buf.len() >= len {
        FrameLen::Complete(len)
    } else {
        FrameLen::Incomplete
    }
}

/// Encode request to RTU frame
pub fn encode_request(request: &ModbusRequest) -> BusResult<Vec<u8>> {
    request.validate()?;

    let mut frame = Vec::with_capacity(9 + request.data.len());
    frame.push(request.slave_id);
    frame.push(request.function.to_u8());
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
            if request.data.len() != 2 {
                return Err(BusError::invalid_data("Single write needs exactly 2 data bytes"));
            }
            frame.extend_from_slice(&request.data);
        }
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.push(request.data.len() as u8);
            frame.extend_from_slice(&request.data);
        }
    }

    append_crc(&mut frame);
    Ok(frame)
}

/// Decode a request frame received while acting as server
pub fn decode_request(frame: &[u8]) -> BusResult<ModbusRequest> {
    check_crc(frame)?;
    if frame.len() < 8 {
        return Err(BusError::frame("RTU request too short"));
    }

    let slave_id = frame[0];
    let function = ModbusFunction::from_u8(frame[1])?;
    let address = BigEndian::read_u16(&frame[2..4]);
    let field = BigEndian::read_u16(&frame[4..6]);
    let body = &frame[..frame.len() - 2];

    let request = match function {
        ModbusFunction::ReadCoils
        | ModbusFunction::ReadDiscreteInputs
        | ModbusFunction::ReadHoldingRegisters
        | ModbusFunction::ReadInputRegisters => ModbusRequest::new_read(slave_id, function, address, field),
        ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => ModbusRequest {
            slave_id,
            function,
            address,
            quantity: 1,
            data: body[4..6].to_vec(),
        },
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            let byte_count = *body
                .get(6)
                .ok_or_else(|| BusError::frame("Missing byte count"))? as usize;
            let data = body
                .get(7..7 + byte_count)
                .ok_or_else(|| BusError::frame("Incomplete write payload"))?;
            ModbusRequest {
                slave_id,
                function,
                address,
                quantity: field,
                data: data.to_vec(),
            }
        }
    };

    Ok(request)
}

/// Encode a response (or exception) to an RTU frame
pub fn encode_response(response: &ModbusResponse) -> Vec<u8> {
    if let Some(exception) = response.exception {
        return encode_exception(response.slave_id, response.function.to_u8(), exception);
    }
    let mut frame = Vec::with_capacity(4 + response.data.len());
    frame.push(response.slave_id);
    frame.push(response.function.to_u8());
    frame.extend_from_slice(&response.data);
    append_crc(&mut frame);
    frame
}

/// Encode an exception frame for any function code, including unsupported ones
pub fn encode_exception(slave_id: u8, function_code: u8, exception: ModbusException) -> Vec<u8> {
    let mut frame = vec![slave_id, function_code | EXCEPTION_FLAG, exception.to_u8()];
    append_crc(&mut frame);
    frame
}

/// Decode response from RTU frame
pub fn decode_response(frame: &[u8]) -> BusResult<ModbusResponse> {
    check_crc(frame)?;

    let data_len = frame.len() - 2;
    let slave_id = frame[0];
    let function_code = frame[1];

    if function_code & EXCEPTION_FLAG != 0 {
        if frame.len() < 5 {
            return Err(BusError::frame("Invalid exception response"));
        }
        let function = ModbusFunction::from_u8(function_code & !EXCEPTION_FLAG)?;
        let exception = ModbusException::from_u8(frame[2]).ok_or_else(|| {
            BusError::frame(format!("Unknown exception code 0x{:02X}", frame[2]))
        })?;
        return Ok(ModbusResponse::new_exception(slave_id, function, exception));
    }

    let function = ModbusFunction::from_u8(function_code)?;
    Ok(ModbusResponse::new_success(slave_id, function, frame[2..data_len].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_vectors() {
        let cases: [(&[u8], u16); 3] = [
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], 0x0BC4),
            (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], 0xCA31),
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], 0x0A84),
        ];
        for (data, expected) in cases {
            assert_eq!(calculate_crc(data), expected, "CRC for {:02X?}", data);
        }
    }

    #[test]
    fn test_encode_read_request() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 2);
        let frame = encode_request(&request).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[test]
    fn test_encode_write_multiple_registers() {
        let request = ModbusRequest::write_multiple_registers(1, 1, &[0x000A, 0x0102]);
        let frame = encode_request(&request).unwrap();
        assert_eq!(&frame[..11], &[0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        assert!(check_crc(&frame).is_ok());
        assert_eq!(request_frame_len(&frame), FrameLen::Complete(frame.len()));
    }

    #[test]
    fn test_decode_request_matches_encoded() {
        let request = ModbusRequest::write_multiple_coils(7, 20, &[true, false, true]);
        let frame = encode_request(&request).unwrap();
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.slave_id, 7);
        assert_eq!(decoded.quantity, 3);
        assert_eq!(decoded.coil_values(), vec![true, false, true]);
    }

    #[test]
    fn test_decode_response_with_bad_crc() {
        let frame = [0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x00, 0x00];
        assert!(matches!(decode_response(&frame), Err(BusError::CrcMismatch { .. })));
    }

    #[test]
    fn test_exception_response_encoding() {
        let response = ModbusResponse::new_exception(
            1,
            ModbusFunction::ReadHoldingRegisters,
            ModbusException::IllegalDataAddress,
        );
        let frame = encode_response(&response);
        assert_eq!(&frame[..3], &[0x01, 0x83, 0x02]);
        assert_eq!(response_frame_len(&frame), FrameLen::Complete(5));
        assert_eq!(decode_response(&frame).unwrap().exception, Some(ModbusException::IllegalDataAddress));
    }

    #[test]
    fn test_frame_len_detection() {
        assert_eq!(response_frame_len(&[0x01]), FrameLen::Incomplete);
        assert_eq!(response_frame_len(&[0x01, 0x03]), FrameLen::Incomplete);
        assert_eq!(response_frame_len(&[0x01, 0x03, 0x04, 0x00]), FrameLen::Incomplete);
        assert_eq!(response_frame_len(&[0x01, 0x03, 0x02, 0, 0, 0, 0, 0xFF]), FrameLen::Complete(7));
        assert_eq!(response_frame_len(&[0x01, 0x2B, 0x00]), FrameLen::Invalid);
        assert_eq!(request_frame_len(&[0x01, 0x10, 0, 0, 0, 1]), FrameLen::Incomplete);
        assert_eq!(request_frame_len(&[0x01, 0x63]), FrameLen::Invalid);
    }

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap_ms(9600), 5);
        assert_eq!(frame_gap_ms(19_200), 3);
        assert_eq!(frame_gap_ms(115_200), 2);
    }
}
