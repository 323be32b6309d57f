//! Device plugin manager daemon library.
//!
//! [`Manager`] accepts plugin registrations on a Unix socket, streams each
//! plugin's device inventory and reports every change through a callback.
//! [`stub::DevicePluginStub`] is a minimal in-process plugin for tests.

pub mod codec;
pub mod manager;
pub mod stub;

pub use manager::{EndpointError, Generation, Manager, ManagerError, MonitorCallback};
