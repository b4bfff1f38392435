//! Byte-stream channel abstraction.
//!
//! Both protocols run over a [`Channel`]: a duplex byte stream that is
//! opened with a receive callback, written to, and closed. Inbound bytes
//! are pushed to whatever callback is currently installed, possibly from
//! a reader thread, so callbacks must be `Send`.

mod serial;

use serde::{Deserialize, Serialize};

use crate::error::LinkResult;

pub use serial::{list_devices, resolve_port, DeviceInfo, SerialChannel};

/// Callback invoked with each chunk of inbound bytes.
pub type ReceiveCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// A callback that drops everything it receives.
pub fn noop_callback() -> ReceiveCallback {
    Box::new(|_| {})
}

/// USB matching criteria used to pick a port when opening a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortFilter {
    /// USB Vendor ID.
    pub usb_vendor_id: u16,
    /// USB Product ID; `None` matches any product of the vendor.
    #[serde(default)]
    pub usb_product_id: Option<u16>,
}

impl PortFilter {
    /// Check whether a USB device matches this filter.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.usb_vendor_id == vid && self.usb_product_id.map_or(true, |p| p == pid)
    }
}

/// Trait for the transport both protocols share.
///
/// This abstraction allows for simulated devices in tests and alternative
/// transports (e.g. a WebSerial bridge).
#[allow(async_fn_in_trait)]
pub trait Channel {
    /// Open the channel, installing `on_receive` for inbound bytes.
    ///
    /// `filters` narrows port selection; an empty slice accepts any port.
    async fn open(
        &mut self,
        on_receive: ReceiveCallback,
        baud_rate: u32,
        filters: &[PortFilter],
    ) -> LinkResult<()>;

    /// Close the channel. Closing a closed channel is not an error.
    async fn close(&mut self) -> LinkResult<()>;

    /// Write all bytes. Fails with `NotConnected` if the channel is closed.
    async fn write(&mut self, data: &[u8]) -> LinkResult<()>;

    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;

    /// Replace the receive callback.
    fn set_receive_callback(&mut self, on_receive: ReceiveCallback);
}
