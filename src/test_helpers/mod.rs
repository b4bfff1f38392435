//! Test-only simulated devices and fixtures.

pub mod devices;
pub mod fixtures;
