//! Engine errors

use thiserror::Error;
use xfer_core::StoreError;

/// Errors raised while setting up transfers and bridges
///
/// Read and write problems during execution are not errors; they are
/// reported through [`Status`](xfer_core::Status) values and the log.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid transfer at {path}: {reason}")]
    InvalidTransfer { path: String, reason: String },

    #[error("Invalid trigger node {path}: {reason}")]
    InvalidTrigger { path: String, reason: String },

    #[error("Transfers root not found: {0}")]
    RootNotFound(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
