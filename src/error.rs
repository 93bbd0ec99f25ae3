//! Error types for the download engine

use std::path::PathBuf;
use thiserror::Error;

/// Engine error taxonomy
///
/// The variants map one-to-one onto the failure classes the orchestrator
/// handles: transient transfer faults are retried, integrity faults trigger
/// backend fallback, resource faults abort before any I/O.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("insufficient resources: {required} bytes required (with buffer), {available} bytes free")]
    ResourceInsufficient { required: u64, available: u64 },

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("transfer of '{key}' interrupted: {reason}")]
    TransferInterrupted { key: String, reason: String },

    #[error("integrity check failed for {path}: {reason}")]
    IntegrityMismatch { path: PathBuf, reason: String },

    #[error("model '{model}' aborted mid-fetch; partial state removed")]
    PartialModel { model: String },

    #[error("model '{0}' not found in catalog")]
    ModelNotFound(String),

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Whether the orchestrator should retry this failure against the same
    /// backend. Integrity failures are never transient: repeatable corruption
    /// means a bad source, not a glitch.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::TransferInterrupted { .. })
    }
}
