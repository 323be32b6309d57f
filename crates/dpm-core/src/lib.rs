//! Core types for the device plugin manager.
//!
//! This crate holds everything a device plugin and the manager must agree
//! on: the device model and snapshot diffing, the newline-delimited JSON
//! wire protocol, registration field validation, and a synchronous
//! registration client for plugin authors. It also carries the manager's
//! configuration and shared logging setup.

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod resource;

pub use config::ManagerConfig;
pub use device::{Device, DeviceDiff, DeviceSet, Health};
pub use error::{ClientError, RegistrationError};
pub use protocol::{ListAndWatchResponse, RegisterAck, RegisterRequest};
pub use resource::{API_VERSION, SUPPORTED_API_VERSIONS};
