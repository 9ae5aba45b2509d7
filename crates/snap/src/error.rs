//! Error types for the SNAP protocol layer.

use iotkit_core::CoreError;
use iotkit_provision::ProvisionError;
use thiserror::Error;

/// Errors that can occur while dispatching frames or running services.
#[derive(Debug, Error)]
pub enum SnapError {
    /// Malformed frame or payload
    #[error("Codec error: {0}")]
    Codec(#[from] CoreError),

    /// Provisioning, trust list or update failure
    #[error("Provision error: {0}")]
    Provision(#[from] ProvisionError),

    /// A service with the same id is already registered
    #[error("Service {0} is already registered")]
    DuplicateService(String),

    /// Registry is full
    #[error("Too many {what}: limit {limit}")]
    CapacityExceeded { what: &'static str, limit: usize },

    /// No service handles the element
    #[error("Unsupported element {element} for service {service}")]
    UnsupportedElement { service: String, element: String },

    /// Netif index out of range or no netif attached
    #[error("No such netif: {0}")]
    NoNetif(usize),

    /// Transport failure reported by a netif
    #[error("Netif error: {0}")]
    NetIf(String),

    /// Frame does not fit the maximum packet size
    #[error("Buffer too small: need {needed}, limit {limit}")]
    BufferTooSmall { needed: usize, limit: usize },

    /// Caller violated an argument contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No response arrived in time
    #[error("Timeout waiting for {element} after {waited_ms} ms")]
    Timeout { element: String, waited_ms: u64 },

    /// Another client transaction is already awaited
    #[error("Client busy with another request")]
    Busy,

    /// Remote device answered with NACK
    #[error("Remote rejected {element}")]
    Nack { element: String },

    /// Shared state lock poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Result type for SNAP operations
pub type SnapResult<T> = Result<T, SnapError>;
