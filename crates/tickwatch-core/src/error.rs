//! Error types shared across the tickwatch crates.

use thiserror::Error;

/// Snapshotting a value failed. Callers treat this as "unchanged this tick".
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("node at {path} is mutably borrowed")]
    Borrowed { path: String },

    #[error("fingerprint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A probe could not be bound to its target.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("probe target must be a record or sequence, got {kind}")]
    NotAReference { kind: &'static str },

    #[error("probe target has been dropped")]
    TargetDropped,
}

/// A subscriber callback did not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("callback failed: {0}")]
    Failed(String),

    #[error("callback invoked re-entrantly while already running")]
    Reentrant,
}

impl CallbackError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
