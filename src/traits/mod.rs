pub mod ports;

pub use ports::{PortLister, SystemPortLister};

#[cfg(test)]
pub use ports::MockPortLister;
