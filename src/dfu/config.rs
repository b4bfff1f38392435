//! Configuration constants for the Nordic secure serial DFU protocol.

use std::time::Duration;

use crate::channel::PortFilter;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// Nordic Semiconductor USB Vendor ID (used by the bootloader).
pub const NORDIC_VID: u16 = 0x1915;

/// Product ID the bootloader enumerates with.
pub const BOOTLOADER_PID: u16 = 0x521F;

/// Port filter matching a device running the bootloader.
pub const BOOTLOADER_FILTER: PortFilter = PortFilter {
    usb_vendor_id: NORDIC_VID,
    usb_product_id: Some(BOOTLOADER_PID),
};

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for the application's text console.
pub const APPLICATION_BAUD_RATE: u32 = 115_200;

/// Baud rate used to probe for and talk to the bootloader.
pub const BOOTLOADER_BAUD_RATE: u32 = 57_600;

/// Serial read timeout for the reader thread's individual reads.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// DFU Protocol Timeouts
// ============================================================================

/// Default timeout waiting for a response frame.
pub const RESPONSE_TIMEOUT_MS: u64 = 500;

/// Default time to collect output after a text command.
pub const COMMAND_TIMEOUT_MS: u64 = 500;

// ============================================================================
// DFU Packet Configuration
// ============================================================================

/// Raw payload bytes carried by one WRITE request.
pub const MAX_RAW_DATA: usize = 1024;

/// Maximum SLIP frame size, also the MTU a compatible bootloader reports.
pub const MAX_SLIP_FRAME: usize = 2051;

/// Packet receipt notifications are disabled; acknowledgment is per object.
pub const PRN_DISABLED: u16 = 0;

/// Escape sequence that asks the application to reboot into the bootloader.
pub const DFU_WAKE_SEQUENCE: &[u8] = &[0x03, b'\n', b'd', b'f', b'u', b'\n', 0xC0];

/// Prompt fragment printed by the application console.
pub const APPLICATION_BANNER: &str = "bmp@";

// ============================================================================
// SLIP Protocol Constants
// ============================================================================

/// SLIP frame delimiter (END byte).
pub const SLIP_END: u8 = 0xC0;

/// SLIP escape byte.
pub const SLIP_ESC: u8 = 0xDB;

/// SLIP escaped END (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// SLIP escaped ESC (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

// ============================================================================
// DFU Opcodes
// ============================================================================

/// Secure DFU operation opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Read the protocol version.
    ProtocolVersion = 0x00,
    /// Create a command or data object.
    Create = 0x01,
    /// Set the packet receipt notification interval.
    SetPrn = 0x02,
    /// Read offset and CRC of the selected object.
    CalcChecksum = 0x03,
    /// Execute the selected object.
    Execute = 0x04,
    /// Select an object and read its cursor.
    Select = 0x06,
    /// Read the maximum frame size.
    Mtu = 0x07,
    /// Write raw object data.
    Write = 0x08,
    /// Ping with an echo id.
    Ping = 0x09,
    /// Read the hardware version.
    HardwareVersion = 0x0A,
    /// Read the firmware version.
    FirmwareVersion = 0x0B,
    /// Abort the transfer.
    Abort = 0x0C,
    /// Response marker (first byte of every reply).
    Response = 0x60,
}

impl Opcode {
    /// Parse an opcode from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Opcode::ProtocolVersion),
            0x01 => Some(Opcode::Create),
            0x02 => Some(Opcode::SetPrn),
            0x03 => Some(Opcode::CalcChecksum),
            0x04 => Some(Opcode::Execute),
            0x06 => Some(Opcode::Select),
            0x07 => Some(Opcode::Mtu),
            0x08 => Some(Opcode::Write),
            0x09 => Some(Opcode::Ping),
            0x0A => Some(Opcode::HardwareVersion),
            0x0B => Some(Opcode::FirmwareVersion),
            0x0C => Some(Opcode::Abort),
            0x60 => Some(Opcode::Response),
            _ => None,
        }
    }
}

/// DFU object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet (firmware.dat).
    Command = 0x01,
    /// Firmware image (firmware.bin).
    Data = 0x02,
}

/// DFU result codes from the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    NotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    InvalidSignature = 0x06,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

impl ResultCode {
    /// Parse a result code; unknown values collapse to `Invalid`.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => ResultCode::Success,
            0x02 => ResultCode::NotSupported,
            0x03 => ResultCode::InvalidParameter,
            0x04 => ResultCode::InsufficientResources,
            0x05 => ResultCode::InvalidObject,
            0x06 => ResultCode::InvalidSignature,
            0x07 => ResultCode::UnsupportedType,
            0x08 => ResultCode::OperationNotPermitted,
            0x0A => ResultCode::OperationFailed,
            0x0B => ResultCode::ExtendedError,
            _ => ResultCode::Invalid,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::Invalid => "Invalid opcode",
            ResultCode::Success => "Operation successful",
            ResultCode::NotSupported => "Operation not supported",
            ResultCode::InvalidParameter => "Invalid parameter",
            ResultCode::InsufficientResources => "Insufficient resources",
            ResultCode::InvalidObject => "Invalid object",
            ResultCode::InvalidSignature => "Invalid signature",
            ResultCode::UnsupportedType => "Unsupported object type",
            ResultCode::OperationNotPermitted => "Operation not permitted",
            ResultCode::OperationFailed => "Operation failed",
            ResultCode::ExtendedError => "Extended error",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Check if a VID/PID combination is the DFU bootloader.
pub fn is_bootloader_device(vid: u16, pid: u16) -> bool {
    vid == NORDIC_VID && pid == BOOTLOADER_PID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=0x60 {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_byte(0x05), None);
    }

    #[test]
    fn test_result_code_unknown_is_invalid() {
        assert_eq!(ResultCode::from_byte(0x01), ResultCode::Success);
        assert_eq!(ResultCode::from_byte(0x0B), ResultCode::ExtendedError);
        assert_eq!(ResultCode::from_byte(0x09), ResultCode::Invalid);
        assert_eq!(ResultCode::from_byte(0xFF), ResultCode::Invalid);
    }

    #[test]
    fn test_is_bootloader_device() {
        assert!(is_bootloader_device(NORDIC_VID, BOOTLOADER_PID));
        assert!(!is_bootloader_device(NORDIC_VID, 0x1234));
        assert!(!is_bootloader_device(0x239A, BOOTLOADER_PID));
    }

    #[test]
    fn test_frame_fits_one_write() {
        // opcode + payload, every byte escaped, plus END
        assert!((1 + MAX_RAW_DATA) * 2 + 1 <= MAX_SLIP_FRAME);
    }
}
