//! Core error types

use thiserror::Error;

/// Core error type shared by the wire codec and device types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input ended before a field could be read
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required by the field
        needed: usize,
        /// Bytes left in the input
        available: usize,
    },

    /// Destination cannot hold the encoded value
    #[error("Buffer too small: needed {needed} bytes, capacity {capacity}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        capacity: usize,
    },

    /// Field carries a value outside its domain
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// Offending value
        value: u64,
    },

    /// Argument contract violated by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
