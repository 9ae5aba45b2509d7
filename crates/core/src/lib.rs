//! Core building blocks for the device security kit.
//!
//! This crate provides the error type, explicit big-endian wire codec,
//! device identity types, file versions, configuration and logging setup
//! shared by the provisioning and protocol crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;
pub mod version;
pub mod wire;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use types::{
    fixed, DeviceIdentity, DeviceRoles, MacAddr, DEVICE_SERIAL_SIZE, DEVICE_TYPE_SIZE,
    MAC_ADDR_LEN, MANUFACTURE_ID_SIZE,
};
pub use version::{
    FileInfo, FileVersion, VersionOrdering, FILE_INFO_SIZE, FILE_VERSION_SIZE, VERSION_EPOCH_UNIX,
};
pub use wire::{WireReader, WireWriter};
