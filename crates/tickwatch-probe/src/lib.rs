#![forbid(unsafe_code)]

//! Change probes and the keyed registry that manages them.
//!
//! A [`Probe`] polls one property of a shared record or sequence on an
//! injected scheduler and notifies its callbacks when the value diverges from
//! its last snapshot. A [`ProbeRegistry`] owns many probes under string keys
//! and drives them individually or from one shared loop.

pub mod callback;
pub mod error;
pub mod interval;
pub mod probe;
pub mod registry;

pub use callback::{Callback, CallbackFailure, CallbackHandle, CallbackList, invoke_all};
pub use error::{IntervalParseError, RegistryError};
pub use interval::{MIN_INTERVAL, PollInterval};
pub use probe::{Probe, ProbeOptions, Property};
pub use registry::{KEY_SPACE, ProbeRegistry, Registration, Scope};
