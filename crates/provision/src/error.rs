//! Error types for provisioning, trust list and firmware operations.

use crate::quorum::QuorumError;
use crate::secmodule::SecmoduleError;
use crate::storage::StorageError;
use iotkit_core::{CoreError, FileVersion};
use thiserror::Error;

/// Errors that can occur while provisioning keys or handling signed files.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Security module failure
    #[error("Secmodule error: {0}")]
    Secmodule(#[from] SecmoduleError),

    /// Storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Malformed record or file part
    #[error("Codec error: {0}")]
    Codec(#[from] CoreError),

    /// Signature quorum not satisfied
    #[error("Quorum error: {0}")]
    Quorum(#[from] QuorumError),

    /// Caller violated an argument contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Output does not fit the caller's limit
    #[error("Buffer too small: need {needed}, limit {limit}")]
    BufferTooSmall { needed: usize, limit: usize },

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation needs a provisioned device
    #[error("Device is not initialized")]
    NotInitialized,

    /// Key slots are frozen after provisioning
    #[error("Device is already initialized")]
    AlreadyInitialized,

    /// Signature or integrity check failed
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Part delivered before its predecessor
    #[error("Out of sequence: {0}")]
    OutOfSequence(String),

    /// Candidate is not newer than the installed file
    #[error("Candidate {candidate} is not newer than installed {current}")]
    NotNewer {
        candidate: FileVersion,
        current: FileVersion,
    },

    /// Shared state lock poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Operation is not provided by this implementation
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type for provisioning operations
pub type ProvisionResult<T> = Result<T, ProvisionError>;
