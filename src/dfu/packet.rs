//! DFU request encoding and response parsing.
//!
//! Requests are `[opcode, payload...]`; responses are
//! `[0x60, echoed_opcode, result_code, payload...]`. Both travel SLIP-framed.
//! Multi-byte fields are little-endian.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

use super::config::{ObjectType, Opcode, ResultCode};
use crate::error::{LinkError, LinkResult};

/// The bootloader checks objects with the common zlib/PNG CRC32.
pub static DFU_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Running CRC32 over the bytes of an object stream.
pub type RunningCrc = Digest<'static, u32>;

/// CRC32 of a whole buffer.
pub fn crc32(data: &[u8]) -> u32 {
    DFU_CRC32.checksum(data)
}

/// Start a running CRC32 seeded with `prefix`.
pub fn running_crc(prefix: &[u8]) -> RunningCrc {
    let mut digest = DFU_CRC32.digest();
    digest.update(prefix);
    digest
}

/// Remote cursor for a DFU object, as reported by SELECT or CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectState {
    /// Largest object the bootloader accepts (0 when reported by CRC).
    pub max_size: u32,
    /// Bytes of the object the bootloader has received.
    pub offset: u32,
    /// CRC32 of those bytes.
    pub crc: u32,
}

impl ObjectState {
    /// Parse a SELECT payload: `max_size`, `offset`, `crc`.
    pub fn parse_select(payload: &[u8]) -> LinkResult<Self> {
        if payload.len() < 12 {
            return Err(LinkError::MalformedResponse {
                len: payload.len(),
            });
        }

        Ok(Self {
            max_size: read_u32(payload, 0),
            offset: read_u32(payload, 4),
            crc: read_u32(payload, 8),
        })
    }

    /// Parse a CRC payload: `offset`, `crc`. Returns `None` when the
    /// bootloader sent no usable checksum.
    pub fn parse_checksum(payload: &[u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }

        Some(Self {
            max_size: 0,
            offset: read_u32(payload, 0),
            crc: read_u32(payload, 4),
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// ============================================================================
// Request Builders
// ============================================================================

/// Build `[opcode, payload...]`.
pub fn build_request(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(1 + payload.len());
    request.push(opcode as u8);
    request.extend_from_slice(payload);
    request
}

/// Payload for CREATE: object type and size.
pub fn create_payload(object: ObjectType, size: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5);
    payload.push(object as u8);
    payload.extend_from_slice(&size.to_le_bytes());
    payload
}

/// Payload for SET_PRN.
pub fn prn_payload(prn: u16) -> [u8; 2] {
    prn.to_le_bytes()
}

// ============================================================================
// Response Parsing
// ============================================================================

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// First byte; 0x60 for a well-formed response.
    pub marker: u8,
    /// Opcode the bootloader says it is answering.
    pub opcode: u8,
    /// Result code.
    pub result: ResultCode,
    /// Bytes after the result code.
    pub payload: Vec<u8>,
}

impl Response {
    /// Parse a response from a decoded SLIP frame.
    pub fn parse(frame: &[u8]) -> LinkResult<Self> {
        if frame.len() < 3 {
            return Err(LinkError::MalformedResponse { len: frame.len() });
        }

        Ok(Self {
            marker: frame[0],
            opcode: frame[1],
            result: ResultCode::from_byte(frame[2]),
            payload: frame[3..].to_vec(),
        })
    }

    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }

    /// Extended error sub-code, present only for `ExtendedError`.
    pub fn extended_code(&self) -> Option<u8> {
        if self.result == ResultCode::ExtendedError {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Turn a failing response into a command error for `sent`.
    pub fn into_result(self, sent: Opcode) -> LinkResult<Vec<u8>> {
        if self.is_success() {
            Ok(self.payload)
        } else {
            Err(LinkError::Command {
                opcode: sent,
                extended: self.extended_code(),
                result: self.result,
            })
        }
    }
}
