#![forbid(unsafe_code)]

//! Shared state record with three notification channels.
//!
//! # Design
//!
//! A [`StateStore`] owns one insertion-ordered record plus two staging areas:
//!
//! - **pending merge**: batched writes from [`StateStore::set_state`], folded
//!   together and committed to the record once per tick;
//! - **update log**: a detached copy of every logged write, drained once per
//!   tick to sequential subscribers.
//!
//! Two internal committer probes (`pendingMerge`, `updateLog`) watch the
//! staging areas and are installed lazily on the first batched write. They
//! live in their own registry and always run on the store's interval.
//!
//! The channels differ in when they fire:
//!
//! | Channel    | Subscribe with                   | Fires                              |
//! |------------|----------------------------------|------------------------------------|
//! | snapshot   | [`StateStore::subscribe`]        | on net change between ticks        |
//! | sequential | [`StateStore::subscribe_sequential`] | once per logged write, in order |
//! | trigger    | [`StateStore::subscribe_trigger`] | synchronously inside `set_state`  |
//!
//! # Invariants
//!
//! 1. `set_state` never mutates the record directly, except for keys with
//!    trigger subscribers, which commit immediately.
//! 2. Log entries are deep copies. Later mutation of a payload never changes
//!    what sequential subscribers see.
//! 3. Entries appended while the log is being drained are delivered on the
//!    next tick, never dropped.
//! 4. No store borrow is held while a subscriber runs.
//!
//! # Failure Modes
//!
//! - **Payload node mutably borrowed**: `set_state` returns
//!   [`StoreError::Snapshot`] and nothing is staged or logged.
//! - **Subscriber fails**: logged and collected for
//!   [`StateStore::take_failures`].

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tickwatch_core::{Record, RecordRef, Scheduler, SeqRef, SnapshotCodec, Value, unix_millis};
use tickwatch_probe::{
    Callback, CallbackFailure, CallbackHandle, CallbackList, PollInterval, ProbeOptions,
    ProbeRegistry, Registration, invoke_all,
};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::merge;

/// Registry key of the committer watching the pending merge.
pub const PENDING_MERGE_KEY: &str = "pendingMerge";
/// Registry key of the committer watching the update log.
pub const UPDATE_LOG_KEY: &str = "updateLog";
/// Log entry key announcing an added state key.
pub const STATE_ADDED: &str = "stateAdded";
/// Log entry key announcing a removed state key.
pub const STATE_REMOVED: &str = "stateRemoved";
/// Log entry key carrying the write timestamp. Never fanned out.
pub const TIMESTAMP_KEY: &str = "stateUpdateTimeStamp";

struct StoreState {
    record: RecordRef,
    pending: RecordRef,
    log: SeqRef,
    sequential: IndexMap<String, CallbackList>,
    triggers: IndexMap<String, CallbackList>,
    config: StoreConfig,
    codec: SnapshotCodec,
    staged_stamp: Option<u64>,
    last_commit: Option<u64>,
    failures: Vec<CallbackFailure>,
}

struct Shared {
    state: RefCell<StoreState>,
    committers: ProbeRegistry,
    keys: ProbeRegistry,
}

/// A handle to a shared state store.
///
/// Cloning a `StateStore` creates a new handle to the **same** store.
#[derive(Clone)]
pub struct StateStore {
    shared: Rc<Shared>,
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("StateStore")
            .field("keys", &state.record.borrow().keys().collect::<Vec<_>>())
            .field("pending", &state.pending.borrow().len())
            .field("log", &state.log.borrow().len())
            .field("config", &state.config)
            .finish()
    }
}

impl StateStore {
    pub fn new(initial: Record, config: StoreConfig, scheduler: Rc<dyn Scheduler>) -> Self {
        let state = StoreState {
            record: Rc::new(RefCell::new(initial)),
            pending: Rc::new(RefCell::new(Record::new())),
            log: Rc::new(RefCell::new(Vec::new())),
            sequential: IndexMap::new(),
            triggers: IndexMap::new(),
            config,
            codec: SnapshotCodec::new(config.codec),
            staged_stamp: None,
            last_commit: None,
            failures: Vec::new(),
        };
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(state),
                committers: ProbeRegistry::new(Rc::clone(&scheduler)),
                keys: ProbeRegistry::new(scheduler),
            }),
        }
    }

    /// Empty store with [`StoreConfig::from_env`].
    pub fn from_env(scheduler: Rc<dyn Scheduler>) -> Self {
        Self::new(Record::new(), StoreConfig::from_env(), scheduler)
    }

    fn downgrade(&self) -> Weak<Shared> {
        Rc::downgrade(&self.shared)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    // --- reads ---

    /// The live record. Mutating it bypasses every channel.
    #[must_use]
    pub fn record(&self) -> RecordRef {
        Rc::clone(&self.shared.state.borrow().record)
    }

    /// The live pending merge.
    #[must_use]
    pub fn pending(&self) -> RecordRef {
        Rc::clone(&self.shared.state.borrow().pending)
    }

    /// Entries waiting in the update log.
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.shared.state.borrow().log.borrow().len()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.record().borrow().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.record().borrow().contains_key(key)
    }

    /// Record keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.record().borrow().keys().cloned().collect()
    }

    /// Detached, bounded copy of the whole record.
    pub fn get_state(&self) -> Result<Value, StoreError> {
        let (record, codec) = {
            let state = self.shared.state.borrow();
            (Rc::clone(&state.record), state.codec)
        };
        Ok(codec.reduce(&Value::Record(record))?)
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.shared.state.borrow().config
    }

    /// Timestamp (Unix millis) of the most recently committed batched write.
    #[must_use]
    pub fn last_commit_stamp(&self) -> Option<u64> {
        self.shared.state.borrow().last_commit
    }

    /// Drain subscriber failures from every channel.
    pub fn take_failures(&self) -> Vec<CallbackFailure> {
        let mut failures = mem::take(&mut self.shared.state.borrow_mut().failures);
        failures.extend(self.shared.committers.take_failures());
        failures.extend(self.shared.keys.take_failures());
        failures
    }

    // --- writes ---

    /// Insert `key` immediately and announce it on the log.
    ///
    /// With `onchange`, also attaches a snapshot subscription and returns its
    /// handle.
    pub fn add_to_state(
        &self,
        key: &str,
        value: Value,
        onchange: Option<Callback>,
    ) -> Result<Option<CallbackHandle>, StoreError> {
        self.ensure_committers();
        self.record().borrow_mut().insert(key.to_string(), value);
        self.set_sequential_state([(STATE_ADDED, Value::from(key))])?;
        match onchange {
            Some(callback) => Ok(Some(self.add_secondary_key_response(key, callback)?)),
            None => Ok(None),
        }
    }

    /// Stage a batched write and log it.
    ///
    /// The payload is deep-copied twice: once into the log, once into the
    /// pending merge. With `append_arrays`, sequences and records already
    /// pending merge with the incoming ones (see [`merge`]). Keys with
    /// trigger subscribers commit before this returns.
    ///
    /// Returns the live pending merge.
    pub fn set_state<K: Into<String>>(
        &self,
        partial: impl IntoIterator<Item = (K, Value)>,
        append_arrays: bool,
    ) -> Result<RecordRef, StoreError> {
        self.ensure_committers();
        let payload = Value::record(partial);
        let stamp = unix_millis();
        let (codec, pending) = {
            let state = self.shared.state.borrow();
            (state.codec, Rc::clone(&state.pending))
        };
        let entry = codec.deep_copy(&payload)?;
        let staged = codec.deep_copy(&payload)?;

        self.append_log(entry, stamp);
        if let Value::Record(staged) = staged {
            let staged = mem::take(&mut *staged.borrow_mut());
            merge::fold(&mut pending.borrow_mut(), staged, append_arrays);
        }
        self.shared.state.borrow_mut().staged_stamp = Some(stamp);
        if let Some(probe) = self.shared.committers.get(PENDING_MERGE_KEY) {
            probe.invalidate();
        }
        self.fire_triggers(stamp);
        Ok(pending)
    }

    /// Log a write without staging it. Only sequential subscribers see it.
    pub fn set_sequential_state<K: Into<String>>(
        &self,
        partial: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<(), StoreError> {
        self.ensure_committers();
        let payload = Value::record(partial);
        let codec = self.shared.state.borrow().codec;
        let entry = codec.deep_copy(&payload)?;
        self.append_log(entry, unix_millis());
        Ok(())
    }

    /// Overwrite `key` directly, skipping every channel.
    ///
    /// An absent (or null) key is added with [`StateStore::add_to_state`]
    /// instead.
    pub fn update_state(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let existing = self.get(key);
        if existing.as_ref().is_none_or(Value::is_null) {
            self.add_to_state(key, value, None)?;
            return Ok(());
        }
        self.record().borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    /// Remove `key` and everything subscribed to it, then log the removal.
    pub fn remove_state(&self, key: &str) -> Result<(), StoreError> {
        if self.shared.keys.has_key(key) {
            self.shared.keys.remove(key)?;
        }
        {
            let mut state = self.shared.state.borrow_mut();
            state.sequential.shift_remove(key);
            state.triggers.shift_remove(key);
            state.pending.borrow_mut().shift_remove(key);
            state.record.borrow_mut().shift_remove(key);
        }
        self.set_sequential_state([(STATE_REMOVED, Value::from(key))])
    }

    fn append_log(&self, entry: Value, stamp: u64) {
        if let Some(rec) = entry.as_record() {
            rec.borrow_mut()
                .insert(TIMESTAMP_KEY.to_string(), Value::from(stamp as f64));
        }
        let log = Rc::clone(&self.shared.state.borrow().log);
        log.borrow_mut().push(entry);
        if let Some(probe) = self.shared.committers.get(UPDATE_LOG_KEY) {
            probe.invalidate();
        }
    }

    /// Commit pending keys that have trigger subscribers and notify them.
    fn fire_triggers(&self, stamp: u64) {
        let fired: Vec<(String, Value, Vec<(CallbackHandle, Callback)>)> = {
            let mut state = self.shared.state.borrow_mut();
            if state.triggers.is_empty() {
                return;
            }
            let mut pending = state.pending.borrow_mut();
            let mut record = state.record.borrow_mut();
            let mut fired = Vec::new();
            for (key, list) in &state.triggers {
                if list.is_empty() {
                    continue;
                }
                let Some(value) = pending.shift_remove(key) else {
                    continue;
                };
                record.insert(key.clone(), value.clone());
                fired.push((key.clone(), value, list.snapshot()));
            }
            drop(record);
            drop(pending);
            if !fired.is_empty() {
                state.last_commit = Some(stamp);
            }
            fired
        };
        let mut failures = Vec::new();
        for (key, value, callbacks) in fired {
            debug!(key = %key, callbacks = callbacks.len(), "store.trigger");
            failures.extend(invoke_all(&format!("trigger:{key}"), &callbacks, &value));
        }
        self.shared.state.borrow_mut().failures.extend(failures);
    }

    // --- committers ---

    fn ensure_committers(&self) {
        if self.shared.committers.has_key(PENDING_MERGE_KEY) {
            return;
        }
        let (pending, log, interval, debug) = {
            let state = self.shared.state.borrow();
            (
                Rc::clone(&state.pending),
                Rc::clone(&state.log),
                state.config.interval,
                state.config.debug,
            )
        };
        let options = ProbeOptions::default().interval(interval).debug(debug);

        let weak = self.downgrade();
        let commit = Callback::new(move |_| {
            if let Some(store) = Self::upgrade(&weak) {
                store.commit_pending();
            }
        });
        let weak = self.downgrade();
        let drain = Callback::new(move |_| {
            if let Some(store) = Self::upgrade(&weak) {
                store.drain_log();
            }
        });

        for (key, target, callback) in [
            (PENDING_MERGE_KEY, Value::Record(pending), commit),
            (UPDATE_LOG_KEY, Value::Sequence(log), drain),
        ] {
            let registration = Registration::new(&target)
                .key(key)
                .primary(callback)
                .options(options.clone());
            if let Err(err) = self.shared.committers.register(registration) {
                warn!(key, error = %err, "could not install committer");
            }
        }
        debug!("store.committers.installed");
    }

    /// Move the pending merge into the record.
    fn commit_pending(&self) {
        let mut state = self.shared.state.borrow_mut();
        let staged = mem::take(&mut *state.pending.borrow_mut());
        if staged.is_empty() {
            return;
        }
        let count = staged.len();
        state.record.borrow_mut().extend(staged);
        if let Some(stamp) = state.staged_stamp.take() {
            state.last_commit = Some(stamp);
        }
        if state.config.debug {
            debug!(keys = count, "store.commit");
        }
    }

    /// Deliver log entries present at the start of the drain, then drop them.
    fn drain_log(&self) {
        let (entries, subscribers) = {
            let state = self.shared.state.borrow();
            let entries = state.log.borrow().clone();
            (entries, state.sequential.clone())
        };
        let mut failures = Vec::new();
        for entry in &entries {
            let Some(rec) = entry.as_record() else { continue };
            let fields: Vec<(String, Value)> = rec
                .borrow()
                .iter()
                .filter(|(key, _)| key.as_str() != TIMESTAMP_KEY)
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            for (key, value) in fields {
                if let Some(list) = subscribers.get(&key) {
                    let label = format!("sequential:{key}");
                    failures.extend(invoke_all(&label, &list.snapshot(), &value));
                }
            }
        }

        let remaining = {
            let mut state = self.shared.state.borrow_mut();
            state.failures.extend(failures);
            let mut log = state.log.borrow_mut();
            let delivered = entries.len().min(log.len());
            log.drain(..delivered);
            !log.is_empty()
        };
        if remaining && let Some(probe) = self.shared.committers.get(UPDATE_LOG_KEY) {
            probe.invalidate();
        }
    }

    // --- snapshot channel ---

    /// Subscribe to net changes of `key`.
    ///
    /// An absent key is created as null. When neither the key nor a probe for
    /// it existed, `callback` becomes the new probe's primary; otherwise it is
    /// added as a secondary.
    pub fn subscribe(&self, key: &str, callback: Callback) -> Result<CallbackHandle, StoreError> {
        let present = self.contains(key);
        if !present {
            self.add_to_state(key, Value::Null, None)?;
        }
        if present || self.shared.keys.has_key(key) {
            return self.add_secondary_key_response(key, callback);
        }
        self.set_primary_key_response(key, callback)?;
        Ok(CallbackHandle::Primary)
    }

    pub fn unsubscribe(&self, key: &str, handle: CallbackHandle) -> Result<(), StoreError> {
        self.remove_secondary_key_response(key, Some(handle))
    }

    /// Drop the key's probe and the key itself.
    pub fn unsubscribe_all(&self, key: &str) -> Result<(), StoreError> {
        if self.shared.keys.has_key(key) {
            self.shared.keys.remove(key)?;
        }
        self.record().borrow_mut().shift_remove(key);
        Ok(())
    }

    fn key_probe(&self, key: &str, primary: Option<Callback>) -> Result<(), StoreError> {
        let (record, config) = {
            let state = self.shared.state.borrow();
            (Rc::clone(&state.record), state.config)
        };
        let mut registration = Registration::new(&Value::Record(record))
            .key(key)
            .property(key)
            .options(
                ProbeOptions::default()
                    .interval(config.interval)
                    .debug(config.debug)
                    .start_running(config.auto_start),
            );
        if let Some(primary) = primary {
            registration = registration.primary(primary);
        }
        self.shared.keys.register(registration)?;
        Ok(())
    }

    /// Replace the primary callback of `key`'s probe, creating the probe if
    /// needed. The record is not touched.
    ///
    /// A stopped probe is restarted when `auto_start` is set, unless the
    /// registry is synchronous.
    pub fn set_primary_key_response(
        &self,
        key: &str,
        callback: Callback,
    ) -> Result<(), StoreError> {
        let Some(probe) = self.shared.keys.get(key) else {
            return self.key_probe(key, Some(callback));
        };
        probe.set_primary(callback);
        if self.config().auto_start && !self.shared.keys.is_synchronous() {
            probe.start();
        }
        Ok(())
    }

    /// Attach a secondary callback to `key`'s probe, creating it if needed.
    ///
    /// Restarts a probe stopped by removing its last callback when
    /// `auto_start` is set.
    pub fn add_secondary_key_response(
        &self,
        key: &str,
        callback: Callback,
    ) -> Result<CallbackHandle, StoreError> {
        if !self.shared.keys.has_key(key) {
            self.key_probe(key, None)?;
        }
        let start = self.config().auto_start;
        self.shared
            .keys
            .add_func(key, callback, start)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::MissingKey {
                key: key.to_string(),
            })
    }

    /// Remove one callback (or all with `None`). The probe stops once it has
    /// none left.
    pub fn remove_secondary_key_response(
        &self,
        key: &str,
        handle: Option<CallbackHandle>,
    ) -> Result<(), StoreError> {
        self.shared.keys.remove_funcs(key, handle, false)?;
        Ok(())
    }

    /// Drop the probe for `key`, or every per-key probe with `None`.
    pub fn clear_all_key_responses(&self, key: Option<&str>) -> Result<usize, StoreError> {
        Ok(self.shared.keys.remove(key)?)
    }

    pub fn key_sub_callbacks(&self, key: &str) -> Result<Vec<CallbackHandle>, StoreError> {
        Ok(self.shared.keys.funcs(key)?)
    }

    // --- sequential channel ---

    /// Receive every logged write touching `key`, in call order.
    ///
    /// An absent key is created as null, except the structural
    /// [`STATE_ADDED`] / [`STATE_REMOVED`] keys.
    pub fn subscribe_sequential(
        &self,
        key: &str,
        callback: Callback,
    ) -> Result<CallbackHandle, StoreError> {
        if key != STATE_ADDED && key != STATE_REMOVED && !self.contains(key) {
            self.add_to_state(key, Value::Null, None)?;
        }
        let mut state = self.shared.state.borrow_mut();
        Ok(state
            .sequential
            .entry(key.to_string())
            .or_default()
            .push(callback))
    }

    pub fn unsubscribe_sequential(&self, key: &str, handle: CallbackHandle) -> bool {
        let mut state = self.shared.state.borrow_mut();
        state
            .sequential
            .get_mut(key)
            .is_some_and(|list| list.remove(handle))
    }

    pub fn unsubscribe_all_sequential(&self, key: &str) -> bool {
        self.shared
            .state
            .borrow_mut()
            .sequential
            .shift_remove(key)
            .is_some()
    }

    // --- trigger channel ---

    /// Commit and notify synchronously whenever `set_state` stages `key`.
    pub fn subscribe_trigger(&self, key: &str, callback: Callback) -> CallbackHandle {
        self.shared
            .state
            .borrow_mut()
            .triggers
            .entry(key.to_string())
            .or_default()
            .push(callback)
    }

    pub fn unsubscribe_trigger(&self, key: &str, handle: CallbackHandle) -> bool {
        let mut state = self.shared.state.borrow_mut();
        state
            .triggers
            .get_mut(key)
            .is_some_and(|list| list.remove(handle))
    }

    pub fn unsubscribe_all_triggers(&self, key: &str) -> bool {
        self.shared
            .state
            .borrow_mut()
            .triggers
            .shift_remove(key)
            .is_some()
    }

    // --- lifecycle ---

    /// Check every per-key probe from one shared loop. New per-key probes are
    /// created stopped.
    pub fn run_synchronous_listeners(&self) {
        let interval = {
            let mut state = self.shared.state.borrow_mut();
            state.config.auto_start = false;
            state.config.interval
        };
        self.shared.keys.start_sync(interval);
    }

    /// Change the cadence of committers and per-key probes, current and future.
    pub fn set_interval(&self, interval: PollInterval) {
        self.shared.state.borrow_mut().config.interval = interval;
        self.shared.keys.set_interval_all(interval);
        self.shared.committers.set_interval_all(interval);
        if self.shared.keys.is_synchronous() {
            self.shared.keys.start_sync(interval);
        }
    }

    /// Start per-key probes: one key, or all with `None`.
    pub fn start(&self, key: Option<&str>) -> Result<(), StoreError> {
        self.shared.keys.start(key)?;
        Ok(())
    }

    /// Stop per-key probes without forgetting their callbacks.
    pub fn stop(&self, key: Option<&str>) -> Result<(), StoreError> {
        self.shared.keys.stop(key)?;
        Ok(())
    }

    /// Whether the store's committers have been installed.
    #[must_use]
    pub fn has_committers(&self) -> bool {
        self.shared.committers.has_key(PENDING_MERGE_KEY)
    }
}
