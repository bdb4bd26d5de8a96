#![forbid(unsafe_code)]

//! Polling change probes.
//!
//! # Design
//!
//! A [`Probe`] watches one property (or every property) of a record or
//! sequence it does not own. It remembers a snapshot of what it last saw and,
//! once per tick, compares a fresh snapshot against it. Scalars compare
//! directly; everything else compares by [`SnapshotCodec`] fingerprint.
//!
//! Ticks are driven by an injected [`Scheduler`]. A running probe keeps at
//! most one tick pending; the pending task holds only a weak handle, so a
//! dropped probe simply stops.
//!
//! # Invariants
//!
//! 1. `check()` right after construction reports no change.
//! 2. After one mutation the next `check()` reports a change exactly once,
//!    invoking the primary and then every secondary in registration order.
//! 3. No probe borrow is held while callbacks run. Callbacks may call back
//!    into the probe (add or remove callbacks, stop, invalidate).
//! 4. A stopped probe has no pending tick and fires no callbacks until it is
//!    started again.
//!
//! # Failure Modes
//!
//! - **Target dropped**: `check()` reports no change and stops the probe.
//! - **Fingerprint fails** (node mutably borrowed): treated as unchanged for
//!   that tick; the stored snapshot is kept.
//! - **Callback fails**: logged, collected for [`Probe::take_failures`], and
//!   the remaining callbacks still run.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use tickwatch_core::{
    ConstructionError, Fingerprint, Primitive, Scheduler, Shape, SnapshotCodec, TaskId, Value,
    WeakValue,
};
use tracing::{debug, warn};

use crate::callback::{Callback, CallbackFailure, CallbackHandle, CallbackList, invoke_all};
use crate::interval::PollInterval;

/// Which part of the target a probe watches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Property {
    /// The whole target.
    #[default]
    Any,
    /// One record key or sequence index.
    Key(String),
}

impl Property {
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Any => None,
            Self::Key(k) => Some(k),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

impl From<&str> for Property {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for Property {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

/// Construction options for a [`Probe`].
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub interval: PollInterval,
    pub debug: bool,
    pub start_running: bool,
    pub codec: SnapshotCodec,
    /// Name used in logs and failure reports. Defaults to the property.
    pub label: Option<String>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            interval: PollInterval::Frame,
            debug: false,
            start_running: true,
            codec: SnapshotCodec::default(),
            label: None,
        }
    }
}

impl ProbeOptions {
    #[must_use]
    pub fn interval(mut self, interval: PollInterval) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn start_running(mut self, start: bool) -> Self {
        self.start_running = start;
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: SnapshotCodec) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Snapshot {
    Primitive(Primitive),
    Print(Fingerprint),
}

impl Snapshot {
    /// Whether moving from `old` to `self` counts as a change.
    fn diverges_from(&self, old: Option<&Snapshot>) -> bool {
        if matches!(self, Self::Print(Fingerprint::Undefined)) {
            return false;
        }
        old != Some(self)
    }
}

struct ProbeInner {
    target: WeakValue,
    property: Property,
    label: String,
    codec: SnapshotCodec,
    snapshot: Option<Snapshot>,
    /// Forces the next check to report a change.
    invalidated: bool,
    primary: Option<Callback>,
    secondaries: CallbackList,
    running: bool,
    interval: PollInterval,
    debug: bool,
    pending: Option<TaskId>,
    failures: Vec<CallbackFailure>,
    scheduler: Rc<dyn Scheduler>,
}

impl ProbeInner {
    /// Read the watched value and snapshot it. `None` once the target is gone.
    fn observe(&self) -> Option<(Value, Snapshot)> {
        let object = self.target.upgrade()?;
        let Property::Key(key) = &self.property else {
            let print = self.codec.fingerprint(&object);
            return Some((object, Snapshot::Print(print)));
        };
        let value = match object.property(key) {
            Ok(value) => value.unwrap_or_default(),
            Err(_) => {
                warn!(probe = %self.label, property = %key, "target borrowed; skipping tick");
                return Some((Value::Null, Snapshot::Print(Fingerprint::Undefined)));
            }
        };
        let snapshot = match value.shape() {
            Shape::Primitive(p) => Snapshot::Primitive(p),
            _ => Snapshot::Print(self.codec.fingerprint(&value)),
        };
        Some((value, snapshot))
    }

    fn fan_out_list(&self) -> Vec<(CallbackHandle, Callback)> {
        let mut callbacks = Vec::with_capacity(self.secondaries.len() + 1);
        if let Some(primary) = &self.primary {
            callbacks.push((CallbackHandle::Primary, primary.clone()));
        }
        callbacks.extend(self.secondaries.snapshot());
        callbacks
    }
}

/// A handle to a polling change probe.
///
/// Cloning a `Probe` creates a new handle to the **same** probe.
#[derive(Clone)]
pub struct Probe {
    inner: Rc<RefCell<ProbeInner>>,
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Probe")
            .field("label", &inner.label)
            .field("property", &inner.property)
            .field("running", &inner.running)
            .field("interval", &inner.interval)
            .field("secondaries", &inner.secondaries.len())
            .finish()
    }
}

impl Probe {
    /// Bind a probe to `target`, capturing the initial snapshot.
    ///
    /// Fails if `target` is not a record or sequence. When
    /// `options.start_running` is set the first tick is scheduled, never run
    /// synchronously.
    pub fn new(
        target: &Value,
        property: impl Into<Property>,
        primary: Option<Callback>,
        options: ProbeOptions,
        scheduler: Rc<dyn Scheduler>,
    ) -> Result<Self, ConstructionError> {
        let weak = target.downgrade().ok_or(ConstructionError::NotAReference {
            kind: target.kind_name(),
        })?;
        let property = property.into();
        let label = options.label.unwrap_or_else(|| property.to_string());
        let mut inner = ProbeInner {
            target: weak,
            property,
            label,
            codec: options.codec,
            snapshot: None,
            invalidated: false,
            primary,
            secondaries: CallbackList::new(),
            running: options.start_running,
            interval: options.interval.clamped(),
            debug: options.debug,
            pending: None,
            failures: Vec::new(),
            scheduler,
        };
        inner.snapshot = inner.observe().map(|(_, s)| s);
        if inner.debug {
            debug!(probe = %inner.label, property = %inner.property, "probe.new");
        }
        let probe = Self {
            inner: Rc::new(RefCell::new(inner)),
        };
        probe.reschedule();
        Ok(probe)
    }

    /// Compare against the stored snapshot and notify on divergence.
    ///
    /// Returns whether a change was reported. Reschedules the next tick when
    /// running and none is pending.
    pub fn check(&self) -> bool {
        let changed = self.detect_and_notify();
        self.reschedule();
        changed
    }

    fn detect_and_notify(&self) -> bool {
        let (value, callbacks, label) = {
            let mut inner = self.inner.borrow_mut();
            let Some((value, snapshot)) = inner.observe() else {
                warn!(probe = %inner.label, "probe target dropped; stopping");
                drop(inner);
                self.stop();
                return false;
            };
            let forced = mem::take(&mut inner.invalidated);
            if !forced && !snapshot.diverges_from(inner.snapshot.as_ref()) {
                if inner.debug {
                    debug!(probe = %inner.label, "probe.check unchanged");
                }
                return false;
            }
            let callbacks = inner.fan_out_list();
            if inner.debug {
                debug!(
                    probe = %inner.label,
                    callbacks = callbacks.len(),
                    forced,
                    "probe.check changed"
                );
            }
            (value, callbacks, inner.label.clone())
        };

        let failures = invoke_all(&label, &callbacks, &value);

        let mut inner = self.inner.borrow_mut();
        if let Some((_, snapshot)) = inner.observe() {
            inner.snapshot = Some(snapshot);
        }
        inner.failures.extend(failures);
        true
    }

    fn reschedule(&self) {
        let (scheduler, interval) = {
            let inner = self.inner.borrow();
            if !inner.running || inner.pending.is_some() {
                return;
            }
            (Rc::clone(&inner.scheduler), inner.interval)
        };
        let weak: Weak<RefCell<ProbeInner>> = Rc::downgrade(&self.inner);
        let id = interval.schedule(
            &*scheduler,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                let probe = Probe { inner };
                {
                    let mut inner = probe.inner.borrow_mut();
                    inner.pending = None;
                    if !inner.running {
                        return;
                    }
                }
                probe.check();
            }),
        );
        self.inner.borrow_mut().pending = Some(id);
    }

    /// Start polling. Idempotent while a tick is pending.
    pub fn start(&self) {
        self.inner.borrow_mut().running = true;
        self.reschedule();
    }

    /// Stop polling and cancel the pending tick. Idempotent.
    pub fn stop(&self) {
        let (pending, scheduler) = {
            let mut inner = self.inner.borrow_mut();
            inner.running = false;
            (inner.pending.take(), Rc::clone(&inner.scheduler))
        };
        if let Some(id) = pending {
            scheduler.cancel(id);
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Whether a tick is currently scheduled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    /// Force the next check to report a change.
    pub fn invalidate(&self) {
        self.inner.borrow_mut().invalidated = true;
    }

    /// Attach a secondary callback.
    pub fn add_func(&self, callback: Callback) -> CallbackHandle {
        self.inner.borrow_mut().secondaries.push(callback)
    }

    /// Remove one callback by handle, or every callback with `None`.
    ///
    /// Returns whether anything was removed.
    pub fn remove_funcs(&self, handle: Option<CallbackHandle>) -> bool {
        let mut inner = self.inner.borrow_mut();
        match handle {
            None => {
                let had = inner.primary.is_some() || !inner.secondaries.is_empty();
                inner.primary = None;
                inner.secondaries.clear();
                had
            }
            Some(CallbackHandle::Primary) => inner.primary.take().is_some(),
            Some(handle) => inner.secondaries.remove(handle),
        }
    }

    /// Handles of all attached callbacks, primary first.
    #[must_use]
    pub fn funcs(&self) -> Vec<CallbackHandle> {
        let inner = self.inner.borrow();
        let mut handles = Vec::with_capacity(inner.secondaries.len() + 1);
        if inner.primary.is_some() {
            handles.push(CallbackHandle::Primary);
        }
        handles.extend(inner.secondaries.handles());
        handles
    }

    #[must_use]
    pub fn has_callbacks(&self) -> bool {
        let inner = self.inner.borrow();
        inner.primary.is_some() || !inner.secondaries.is_empty()
    }

    pub fn set_primary(&self, callback: Callback) {
        self.inner.borrow_mut().primary = Some(callback);
    }

    pub fn clear_primary(&self) {
        self.inner.borrow_mut().primary = None;
    }

    /// Change cadence. Applies from the next scheduled tick.
    pub fn set_interval(&self, interval: PollInterval) {
        self.inner.borrow_mut().interval = interval.clamped();
    }

    #[must_use]
    pub fn interval(&self) -> PollInterval {
        self.inner.borrow().interval
    }

    pub fn set_debug(&self, debug: bool) {
        self.inner.borrow_mut().debug = debug;
    }

    #[must_use]
    pub fn property(&self) -> Property {
        self.inner.borrow().property.clone()
    }

    #[must_use]
    pub fn label(&self) -> String {
        self.inner.borrow().label.clone()
    }

    /// The watched target, if it is still alive.
    #[must_use]
    pub fn target(&self) -> Option<Value> {
        self.inner.borrow().target.upgrade()
    }

    /// Drain callback failures collected since the last call.
    pub fn take_failures(&self) -> Vec<CallbackFailure> {
        mem::take(&mut self.inner.borrow_mut().failures)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
