//! Serial port channel built on the serialport crate.
//!
//! Writes go straight to the port; reads happen on a dedicated thread that
//! forwards every chunk to the installed receive callback.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};

use super::{noop_callback, Channel, PortFilter, ReceiveCallback};
use crate::dfu::config::{is_bootloader_device, SERIAL_READ_TIMEOUT};
use crate::error::{LinkError, LinkResult};
use crate::traits::{PortLister, SystemPortLister};

/// Information about a detected device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Serial port path (e.g., "/dev/cu.usbmodem1234" or "COM3").
    pub port: String,
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Device serial number (if available).
    pub serial_number: Option<String>,
    /// Whether the device is currently in bootloader mode.
    pub in_bootloader: bool,
    /// Product name (if available).
    pub product_name: Option<String>,
}

impl DeviceInfo {
    /// Get a display label for this device.
    pub fn display_label(&self) -> String {
        if let Some(ref name) = self.product_name {
            name.clone()
        } else if self.in_bootloader {
            format!("DFU Bootloader ({})", self.port)
        } else {
            format!("BLE Micro Pro ({})", self.port)
        }
    }
}

/// Find all connected USB serial devices matching any of `filters`.
///
/// An empty filter list accepts every USB serial port.
///
/// On macOS, filters out `tty.*` ports to avoid duplicates (each device
/// appears as both `cu.*` and `tty.*`).
pub fn list_devices(lister: &dyn PortLister, filters: &[PortFilter]) -> Vec<DeviceInfo> {
    let ports = match lister.available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let mut devices = Vec::new();
    for port in ports {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            continue;
        }

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            let accepted =
                filters.is_empty() || filters.iter().any(|f| f.matches(usb_info.vid, usb_info.pid));
            if accepted {
                devices.push(DeviceInfo {
                    port: port.port_name.clone(),
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number.clone(),
                    in_bootloader: is_bootloader_device(usb_info.vid, usb_info.pid),
                    product_name: usb_info.product.clone(),
                });
            }
        }
    }

    devices
}

/// Pick the port to open: the first device matching the filters.
pub fn resolve_port(lister: &dyn PortLister, filters: &[PortFilter]) -> LinkResult<String> {
    list_devices(lister, filters)
        .into_iter()
        .next()
        .map(|d| d.port)
        .ok_or(LinkError::NoDeviceFound)
}

struct Reader {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Serial port [`Channel`] implementation.
pub struct SerialChannel {
    port_name: Option<String>,
    lister: Box<dyn PortLister>,
    port: Option<Box<dyn SerialPort>>,
    callback: Arc<Mutex<ReceiveCallback>>,
    reader: Option<Reader>,
}

impl SerialChannel {
    /// Create a channel that selects its port by filter at open time.
    pub fn new() -> Self {
        Self::with_lister(Box::new(SystemPortLister))
    }

    /// Create a channel bound to an explicit port; filters are ignored.
    pub fn with_port(port_name: &str) -> Self {
        let mut channel = Self::new();
        channel.port_name = Some(port_name.to_string());
        channel
    }

    /// Create a channel with a custom port enumerator.
    pub fn with_lister(lister: Box<dyn PortLister>) -> Self {
        Self {
            port_name: None,
            lister,
            port: None,
            callback: Arc::new(Mutex::new(noop_callback())),
            reader: None,
        }
    }

    fn spawn_reader(&mut self, mut port: Box<dyn SerialPort>) {
        let stop = Arc::new(AtomicBool::new(false));
        let callback = Arc::clone(&self.callback);
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::spawn(move || {
            let mut buffer = [0u8; 256];
            while !stop_flag.load(Ordering::Relaxed) {
                match port.read(&mut buffer) {
                    Ok(0) => {}
                    Ok(n) => {
                        if let Ok(mut on_receive) = callback.lock() {
                            on_receive(&buffer[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        log::warn!("Serial read failed, stopping reader: {}", e);
                        break;
                    }
                }
            }
        });

        self.reader = Some(Reader { stop, thread });
    }

    fn stop_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.stop.store(true, Ordering::Relaxed);
            if reader.thread.join().is_err() {
                log::error!("Serial reader thread panicked");
            }
        }
    }
}

impl Default for SerialChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for SerialChannel {
    async fn open(
        &mut self,
        on_receive: ReceiveCallback,
        baud_rate: u32,
        filters: &[PortFilter],
    ) -> LinkResult<()> {
        if self.is_connected() {
            self.close().await?;
        }

        let port_name = match &self.port_name {
            Some(name) => name.clone(),
            None => resolve_port(self.lister.as_ref(), filters)?,
        };

        log::info!("Opening {} at {} baud", port_name, baud_rate);
        let port = open_with_baud(&port_name, baud_rate).await?;
        let reader_port = port.try_clone()?;

        self.set_receive_callback(on_receive);
        self.spawn_reader(reader_port);
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) -> LinkResult<()> {
        self.stop_reader();
        if self.port.take().is_some() {
            log::debug!("Serial port closed");
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> LinkResult<()> {
        let port = self.port.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(data)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn set_receive_callback(&mut self, on_receive: ReceiveCallback) {
        if let Ok(mut current) = self.callback.lock() {
            *current = on_receive;
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

const MAX_OPEN_RETRIES: u32 = 10;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Open a serial port with a specific baud rate.
///
/// Includes retry logic to handle transient connectivity failures during
/// USB device re-enumeration (e.g., right after entering bootloader mode).
async fn open_with_baud(port_name: &str, baud_rate: u32) -> LinkResult<Box<dyn SerialPort>> {
    let normalized_name = normalize_port_name(port_name);

    let mut port = retry_open(port_name, || {
        serialport::new(&normalized_name, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
    })
    .await?;

    port.write_data_terminal_ready(true).ok();
    port.clear(serialport::ClearBuffer::Input).ok();
    Ok(port)
}

/// Call `open` until it succeeds or fails with a non-transient error,
/// yielding to the runtime between attempts.
async fn retry_open<T, F>(port_name: &str, mut open: F) -> LinkResult<T>
where
    F: FnMut() -> serialport::Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open() {
            Ok(port) => return Ok(port),
            Err(e) if is_transient_open_error(&e) && attempt < MAX_OPEN_RETRIES => {
                log::debug!("Transient open failure on {} ({}), retrying", port_name, e);
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
            }
            Err(e) => return Err(classify_open_error(port_name, e)),
        }
    }
}

fn is_transient_open_error(e: &serialport::Error) -> bool {
    let err_str = e.to_string().to_lowercase();

    // - "not functioning": Windows driver not ready after USB re-enumeration
    // - "resource temporarily unavailable": Device briefly unavailable
    // - "interrupted": Operation interrupted, may succeed on retry
    err_str.contains("not functioning")
        || err_str.contains("temporarily unavailable")
        || err_str.contains("interrupted")
}

fn classify_open_error(port_name: &str, e: serialport::Error) -> LinkError {
    let err_str = e.to_string().to_lowercase();
    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            LinkError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => LinkError::NoDeviceFound,
        _ if err_str.contains("busy") || err_str.contains("in use") => LinkError::PortBusy {
            port: port_name.to_string(),
        },
        _ => LinkError::Serial(e),
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}
