//! Register-read framing for the vibration sensor.
//!
//! Request: `[address, function, start_hi, start_lo, count_hi, count_lo, crc_lo, crc_hi]`.
//! Response: `[address, function, byte_count, registers.., crc_lo, crc_hi]`.

use crate::error::ProtocolError;

/// Holding-register read function code.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Address, function and byte-count bytes ahead of the register data.
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

/// CRC-16 over `data`: initial value 0xFFFF, reflected polynomial 0xA001.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF_u16, |mut crc, &byte| {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// A read of `count` consecutive registers starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u8,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn to_bytes(&self) -> [u8; 8] {
        let [start_hi, start_lo] = self.start.to_be_bytes();
        let [count_hi, count_lo] = self.count.to_be_bytes();
        let body = [
            self.address,
            READ_HOLDING_REGISTERS,
            start_hi,
            start_lo,
            count_hi,
            count_lo,
        ];
        let [crc_lo, crc_hi] = crc16(&body).to_le_bytes();
        [
            body[0], body[1], body[2], body[3], body[4], body[5], crc_lo, crc_hi,
        ]
    }

    /// Minimum size of a valid response.
    pub fn response_len(&self) -> usize {
        HEADER_LEN + 2 * usize::from(self.count) + CRC_LEN
    }

    /// Validates a response frame and returns its registers as signed values.
    ///
    /// Trailing bytes past the expected frame are ignored.
    pub fn parse_response(&self, frame: &[u8]) -> Result<Vec<i16>, ProtocolError> {
        let expected = self.response_len();
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::ShortFrame {
                expected,
                actual: frame.len(),
            });
        }
        if frame[0] != self.address {
            return Err(ProtocolError::AddressMismatch {
                expected: self.address,
                actual: frame[0],
            });
        }
        if frame[1] != READ_HOLDING_REGISTERS {
            return Err(ProtocolError::FunctionMismatch {
                expected: READ_HOLDING_REGISTERS,
                actual: frame[1],
            });
        }
        if frame.len() < expected {
            return Err(ProtocolError::ShortFrame {
                expected,
                actual: frame.len(),
            });
        }

        let payload_end = expected - CRC_LEN;
        let computed = crc16(&frame[..payload_end]);
        let received = u16::from_le_bytes([frame[payload_end], frame[payload_end + 1]]);
        if computed != received {
            return Err(ProtocolError::Checksum { computed, received });
        }

        Ok(frame[HEADER_LEN..payload_end]
            .chunks_exact(2)
            .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}
