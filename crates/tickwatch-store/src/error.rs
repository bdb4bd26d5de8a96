//! Store errors.

use thiserror::Error;
use tickwatch_core::FingerprintError;
use tickwatch_probe::RegistryError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state has no key {key:?}")]
    MissingKey { key: String },

    #[error("could not copy state payload: {0}")]
    Snapshot(#[from] FingerprintError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
