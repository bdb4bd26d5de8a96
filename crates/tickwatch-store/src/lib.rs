#![forbid(unsafe_code)]

//! Shared state store with batched, sequential, and trigger channels.

pub mod config;
pub mod error;
pub mod merge;
pub mod store;

pub use config::StoreConfig;
pub use error::StoreError;
pub use store::{
    PENDING_MERGE_KEY, STATE_ADDED, STATE_REMOVED, StateStore, TIMESTAMP_KEY, UPDATE_LOG_KEY,
};
