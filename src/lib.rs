//! Firmware and configuration transfer for BLE Micro Pro keyboards.
//!
//! Two protocols share one serial link: Nordic secure DFU for firmware
//! (SLIP framed, resumable) and XMODEM-CRC for config and EEPROM blobs.
//! [`session::DeviceSession`] sequences them and talks to the application
//! console.

pub mod channel;
pub mod dfu;
pub mod error;
pub mod session;
pub mod settings;
pub mod traits;
pub mod xmodem;

#[cfg(test)]
mod test_helpers;

pub use channel::{Channel, PortFilter, SerialChannel};
pub use dfu::DfuProtocol;
pub use error::{ErrorKind, LinkError, LinkResult};
pub use session::{Activation, DeviceSession, UpdateOutcome};
pub use settings::{SessionSettings, SettingsManager};
pub use xmodem::XmodemTransfer;
