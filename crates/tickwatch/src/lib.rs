#![forbid(unsafe_code)]

//! tickwatch public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.

pub mod prelude {
    pub use tickwatch_core as core;
    pub use tickwatch_probe as probe;
    #[cfg(feature = "store")]
    pub use tickwatch_store as store;

    pub use tickwatch_core::{
        Callable, CallbackError, FrameSource, LocalScheduler, Opaque, Record, Scheduler,
        SnapshotCodec, Value,
    };
    pub use tickwatch_probe::{
        Callback, CallbackHandle, PollInterval, Probe, ProbeOptions, ProbeRegistry, Property,
        Registration, Scope,
    };
    #[cfg(feature = "store")]
    pub use tickwatch_store::{StateStore, StoreConfig};
}

#[cfg(all(test, feature = "store"))]
mod tests {
    use super::prelude::*;
    use std::rc::Rc;

    #[test]
    fn prelude_wires_a_store() {
        let scheduler = Rc::new(LocalScheduler::new(
            FrameSource::Headless,
            tickwatch_core::clock::Clock::Lab(tickwatch_core::clock::LabClock::new()),
        ));
        let store = StateStore::new(
            Record::new(),
            StoreConfig::default(),
            Rc::clone(&scheduler) as Rc<dyn Scheduler>,
        );
        store.set_state([("ready", Value::from(true))], false).unwrap();
        scheduler.advance(tickwatch_core::scheduler::HEADLESS_FRAME);
        assert_eq!(store.get("ready").and_then(|v| v.as_bool()), Some(true));
    }
}
