//! Errors raised by probes and registries.

use thiserror::Error;
use tickwatch_core::ConstructionError;

/// A registry operation could not be applied.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no probe registered under key {key:?}")]
    MissingKey { key: String },

    #[error("a probe is already registered under key {key:?}")]
    DuplicateKey { key: String },

    #[error("could not allocate an unused probe key")]
    KeySpaceExhausted,

    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

/// A poll interval string could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid poll interval {input:?}: expected \"frame\" or a millisecond count")]
pub struct IntervalParseError {
    pub input: String,
}
