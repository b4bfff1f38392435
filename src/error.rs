//! Error types for the bootloader and block-transfer protocol stack.

use thiserror::Error;

use crate::dfu::config::{Opcode, ResultCode};

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Broad failure category, used by callers that only need to know what
/// class of problem ended an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The channel is unavailable, was denied, or is not connected.
    Transport,
    /// No response arrived within the bound.
    Timeout,
    /// The bootloader answered with a non-success result code.
    Command,
    /// CRC or offset mismatch that resume could not resolve.
    Integrity,
    /// An object or frame exceeds the negotiated size.
    Size,
    /// The remote does not speak the expected protocol.
    ProtocolMismatch,
}

/// Errors that can occur while talking to a device.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel is not open.
    #[error("Channel is not connected")]
    NotConnected,

    /// No port matched the selection criteria.
    #[error("No compatible device found")]
    NoDeviceFound,

    /// Serial port is busy (in use by another process).
    #[error("Port '{port}' is busy or in use by another application")]
    PortBusy { port: String },

    /// Permission denied accessing serial port.
    #[error("Permission denied for port '{port}'")]
    PortPermissionDenied { port: String },

    /// Timeout waiting for a bootloader response.
    #[error("Timeout waiting for response to {opcode:?}")]
    Timeout { opcode: Opcode },

    /// The application console did not confirm a file upload.
    #[error("Device rejected file upload: {reply}")]
    UploadRejected { reply: String },

    /// The remote went quiet during a block transfer.
    #[error("Block transfer stalled for {timeout_ms}ms")]
    TransferStalled { timeout_ms: u64 },

    /// The bootloader rejected a request.
    #[error("{opcode:?} failed: {} (extended code {extended:?})", .result.description())]
    Command {
        opcode: Opcode,
        result: ResultCode,
        extended: Option<u8>,
    },

    /// The remote checksum disagrees with the locally computed CRC32.
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// The remote offset disagrees with the number of bytes streamed.
    #[error("Offset mismatch: expected {expected}, got {actual} (packet lost)")]
    OffsetMismatch { expected: u32, actual: u32 },

    /// The bootloader did not return a checksum.
    #[error("Bootloader returned no checksum")]
    MissingChecksum,

    /// Object is larger than the bootloader accepts.
    #[error("Object size {size} exceeds maximum {max_size}")]
    ObjectTooLarge { size: usize, max_size: usize },

    /// Encoded SLIP frame would exceed the maximum frame size.
    #[error("SLIP frame of {size} bytes exceeds maximum {max_size}")]
    FrameTooLarge { size: usize, max_size: usize },

    /// MTU negotiation returned an unexpected frame size.
    #[error("Wrong MTU {mtu}, expected {expected}")]
    ProtocolMismatch { mtu: u16, expected: u16 },

    /// A response frame too short to carry a result code.
    #[error("Malformed response ({len} bytes)")]
    MalformedResponse { len: usize },
}

impl LinkError {
    /// Check if this error is retriable (transient errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout { .. }
                | LinkError::TransferStalled { .. }
                | LinkError::CrcMismatch { .. }
                | LinkError::OffsetMismatch { .. }
                | LinkError::PortBusy { .. }
        )
    }

    /// Map the error onto its failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Serial(_)
            | LinkError::Io(_)
            | LinkError::NotConnected
            | LinkError::NoDeviceFound
            | LinkError::PortBusy { .. }
            | LinkError::PortPermissionDenied { .. } => ErrorKind::Transport,
            LinkError::Timeout { .. } | LinkError::TransferStalled { .. } => ErrorKind::Timeout,
            LinkError::Command { .. } | LinkError::UploadRejected { .. } => ErrorKind::Command,
            LinkError::CrcMismatch { .. }
            | LinkError::OffsetMismatch { .. }
            | LinkError::MissingChecksum => ErrorKind::Integrity,
            LinkError::ObjectTooLarge { .. } | LinkError::FrameTooLarge { .. } => ErrorKind::Size,
            LinkError::ProtocolMismatch { .. } | LinkError::MalformedResponse { .. } => {
                ErrorKind::ProtocolMismatch
            }
        }
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::Serial(_) => "LNK-001",
            LinkError::Io(_) => "LNK-002",
            LinkError::NotConnected => "LNK-003",
            LinkError::NoDeviceFound => "LNK-004",
            LinkError::PortBusy { .. } => "LNK-005",
            LinkError::PortPermissionDenied { .. } => "LNK-006",
            LinkError::Timeout { .. } => "LNK-010",
            LinkError::TransferStalled { .. } => "LNK-011",
            LinkError::Command { .. } => "LNK-020",
            LinkError::UploadRejected { .. } => "LNK-021",
            LinkError::CrcMismatch { .. } => "LNK-030",
            LinkError::OffsetMismatch { .. } => "LNK-031",
            LinkError::MissingChecksum => "LNK-032",
            LinkError::ObjectTooLarge { .. } => "LNK-040",
            LinkError::FrameTooLarge { .. } => "LNK-041",
            LinkError::ProtocolMismatch { .. } => "LNK-050",
            LinkError::MalformedResponse { .. } => "LNK-051",
        }
    }
}
