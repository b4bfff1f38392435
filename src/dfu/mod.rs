//! Nordic secure serial DFU over SLIP.
//!
//! # Protocol Overview
//!
//! Firmware travels as two objects:
//! 1. **Command object** - the signed init packet (firmware.dat)
//! 2. **Data objects** - the image (firmware.bin), one page at a time
//!
//! Every object follows SELECT, CREATE, WRITE..., CRC, EXECUTE. SELECT
//! reports how much of the object the bootloader already holds, so an
//! interrupted transfer resumes from the last verified byte.
//!
//! # Example
//!
//! ```ignore
//! use bmp_updater::dfu::DfuProtocol;
//!
//! let mut dfu = DfuProtocol::new(&mut channel);
//! if dfu.check_integrity().await? {
//!     dfu.send_init_packet(&init_packet).await?;
//!     dfu.send_firmware(&image, |p| println!("{}%", p)).await?;
//! }
//! ```

pub mod config;
pub mod packet;
mod protocol;
pub mod slip;

pub use protocol::{rewind_offset, DfuProtocol};
