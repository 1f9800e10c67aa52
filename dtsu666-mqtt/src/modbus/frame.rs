//! Modbus RTU framing for the read holding registers function.
//!
//! An RTU ADU is `[unit][function][payload...][crc lo][crc hi]`. Requests carry the start address and register
//! count, responses carry a byte count followed by the register words, or an exception code when the function code
//! has its high bit set.

use bytes::{BufMut, Bytes, BytesMut};

use super::Unit;
use crate::error::TransportError;

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Bytes to read before the total response length is known: unit, function, and byte count (or exception code).
pub const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;
const EXCEPTION_LEN: usize = HEADER_LEN + CRC_LEN;

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn read_request(unit: Unit, address: u16, count: u16) -> Bytes {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit.0);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u16(address);
    frame.put_u16(count);
    let crc = crc16(&frame);
    // The CRC is the only little-endian field on the wire
    frame.put_u16_le(crc);
    frame.freeze()
}

/// Total length of a response frame, given its first [`HEADER_LEN`] bytes.
pub fn response_len(header: &[u8; HEADER_LEN]) -> usize {
    if header[1] & EXCEPTION_FLAG != 0 {
        EXCEPTION_LEN
    } else {
        HEADER_LEN + usize::from(header[2]) + CRC_LEN
    }
}

/// Validate a complete response to a read of `count` registers and extract the register words.
///
/// The CRC is checked over the whole frame before any field is trusted, so corruption anywhere in the frame is
/// reported as a CRC error rather than as a confusing field mismatch.
pub fn parse_read_response(
    frame: &[u8],
    unit: Unit,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    if frame.len() < EXCEPTION_LEN {
        return Err(TransportError::UnexpectedResponse(
            format!("frame of {} bytes is too short", frame.len()).into(),
        ));
    }

    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(TransportError::Crc { computed, received });
    }

    if body[0] != unit.0 {
        return Err(TransportError::UnexpectedResponse(
            format!("answer from unit {} instead of {}", body[0], unit.0).into(),
        ));
    }

    match body[1] {
        READ_HOLDING_REGISTERS => {}
        function if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG => {
            return Err(TransportError::Exception(body[2]));
        }
        function => {
            return Err(TransportError::UnexpectedResponse(
                format!("function code {:#04x}", function).into(),
            ));
        }
    }

    let byte_count = usize::from(body[2]);
    let data = &body[HEADER_LEN..];
    if byte_count != usize::from(count) * 2 || data.len() != byte_count {
        return Err(TransportError::UnexpectedResponse(
            format!(
                "{} data bytes for {} registers (byte count field {})",
                data.len(),
                count,
                byte_count
            )
            .into(),
        ));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Build the response a device would send for a successful read. Used to script fake devices in tests.
#[cfg(test)]
pub(crate) fn read_response(unit: Unit, words: &[u16]) -> Vec<u8> {
    let mut frame = BytesMut::new();
    frame.put_u8(unit.0);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u8((words.len() * 2) as u8);
    for word in words {
        frame.put_u16(*word);
    }
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

#[cfg(test)]
pub(crate) fn exception_response(unit: Unit, code: u8) -> Vec<u8> {
    let mut frame = vec![unit.0, READ_HOLDING_REGISTERS | EXCEPTION_FLAG, code];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}
