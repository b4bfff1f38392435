use serialport::SerialPortInfo;

#[cfg(test)]
use mockall::automock;

use crate::error::LinkResult;

/// Abstraction over OS serial port enumeration.
/// This allows mocking port discovery in tests.
#[cfg_attr(test, automock)]
pub trait PortLister: Send + Sync {
    /// List the serial ports currently present
    fn available_ports(&self) -> LinkResult<Vec<SerialPortInfo>>;
}

/// Real implementation that delegates to serialport::available_ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortLister;

impl PortLister for SystemPortLister {
    fn available_ports(&self) -> LinkResult<Vec<SerialPortInfo>> {
        Ok(serialport::available_ports()?)
    }
}
