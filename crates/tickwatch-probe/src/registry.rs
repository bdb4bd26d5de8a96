#![forbid(unsafe_code)]

//! Keyed probe registry: shared lifecycle management for many probes.
//!
//! A [`ProbeRegistry`] owns an ordered collection of keyed [`Probe`]s that
//! can be controlled together ([`Scope::All`]) or individually
//! ([`Scope::Key`]).
//!
//! Probes normally run their own loops. In synchronous mode
//! ([`ProbeRegistry::start_sync`]) every per-probe loop is stopped and one
//! shared loop checks all probes per tick, in registration order.
//!
//! # Invariants
//!
//! 1. Keys are unique. Registering an existing key fails with
//!    [`RegistryError::DuplicateKey`]; [`ProbeRegistry::replace`] swaps a
//!    probe in place.
//! 2. Operations over [`Scope::All`] iterate a point-in-time copy, so
//!    callbacks may register or remove probes mid-pass.
//! 3. Probes registered while synchronous are created stopped.
//!
//! # Failure Modes
//!
//! - Unknown key: logged at `warn`, returned as [`RegistryError::MissingKey`],
//!   nothing else happens.
//! - Target not a record or sequence: logged, registration aborted.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tickwatch_core::{Scheduler, TaskId, Value};
use tracing::{debug, warn};

use crate::callback::{Callback, CallbackFailure, CallbackHandle};
use crate::error::RegistryError;
use crate::interval::PollInterval;
use crate::probe::{Probe, ProbeOptions, Property};

/// Generated keys are drawn from `0..KEY_SPACE`.
pub const KEY_SPACE: u32 = 100_000;

const KEY_ATTEMPTS: usize = 1024;

/// Which probes an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    All,
    Key(&'a str),
}

impl<'a> From<&'a str> for Scope<'a> {
    fn from(key: &'a str) -> Self {
        Self::Key(key)
    }
}

impl<'a> From<Option<&'a str>> for Scope<'a> {
    fn from(key: Option<&'a str>) -> Self {
        key.map_or(Self::All, Self::Key)
    }
}

/// Arguments for [`ProbeRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: Option<String>,
    pub target: Value,
    pub property: Property,
    pub primary: Option<Callback>,
    pub options: ProbeOptions,
}

impl Registration {
    /// Watch all of `target` under a generated key.
    #[must_use]
    pub fn new(target: &Value) -> Self {
        Self {
            key: None,
            target: target.clone(),
            property: Property::Any,
            primary: None,
            options: ProbeOptions::default(),
        }
    }

    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn property(mut self, property: impl Into<Property>) -> Self {
        self.property = property.into();
        self
    }

    #[must_use]
    pub fn primary(mut self, callback: Callback) -> Self {
        self.primary = Some(callback);
        self
    }

    #[must_use]
    pub fn options(mut self, options: ProbeOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug)]
struct SyncLoop {
    interval: PollInterval,
    pending: Option<TaskId>,
}

struct RegistryInner {
    entries: Vec<(String, Probe)>,
    scheduler: Rc<dyn Scheduler>,
    sync: Option<SyncLoop>,
}

impl RegistryInner {
    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

/// A handle to a keyed collection of probes.
///
/// Cloning a `ProbeRegistry` creates a new handle to the **same** registry.
#[derive(Clone)]
pub struct ProbeRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ProbeRegistry")
            .field("keys", &inner.entries.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("sync", &inner.sync)
            .finish()
    }
}

impl ProbeRegistry {
    #[must_use]
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                entries: Vec::new(),
                scheduler,
                sync: None,
            })),
        }
    }

    /// The scheduler probes in this registry tick on.
    #[must_use]
    pub fn scheduler(&self) -> Rc<dyn Scheduler> {
        Rc::clone(&self.inner.borrow().scheduler)
    }

    // --- membership ---

    /// Create and add a probe. Returns its key.
    pub fn register(&self, registration: Registration) -> Result<String, RegistryError> {
        let key = match &registration.key {
            Some(key) if self.has_key(key) => {
                warn!(key = %key, "probe key already registered");
                return Err(RegistryError::DuplicateKey { key: key.clone() });
            }
            Some(key) => key.clone(),
            None => self.allocate_key()?,
        };
        let probe = self.build(&key, registration)?;
        self.inner.borrow_mut().entries.push((key.clone(), probe));
        Ok(key)
    }

    /// Register under `key`, stopping and replacing any existing probe there.
    ///
    /// The replacement keeps the old probe's position.
    pub fn replace(&self, key: &str, registration: Registration) -> Result<(), RegistryError> {
        let probe = self.build(key, registration)?;
        let old = {
            let mut inner = self.inner.borrow_mut();
            match inner.position(key) {
                Some(idx) => Some(std::mem::replace(&mut inner.entries[idx].1, probe)),
                None => {
                    inner.entries.push((key.to_string(), probe));
                    None
                }
            }
        };
        if let Some(old) = old {
            old.stop();
        }
        Ok(())
    }

    fn build(&self, key: &str, registration: Registration) -> Result<Probe, RegistryError> {
        let Registration {
            target,
            property,
            primary,
            mut options,
            ..
        } = registration;
        if self.is_synchronous() {
            options.start_running = false;
        }
        if options.label.is_none() {
            options.label = Some(key.to_string());
        }
        let scheduler = self.scheduler();
        Probe::new(&target, property, primary, options, scheduler).map_err(|err| {
            warn!(key = %key, error = %err, "probe registration aborted");
            RegistryError::from(err)
        })
    }

    fn allocate_key(&self) -> Result<String, RegistryError> {
        for _ in 0..KEY_ATTEMPTS {
            let key = rand::random_range(0..KEY_SPACE).to_string();
            if !self.has_key(&key) {
                return Ok(key);
            }
        }
        Err(RegistryError::KeySpaceExhausted)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Probe> {
        let inner = self.inner.borrow();
        inner.position(key).map(|idx| inner.entries[idx].1.clone())
    }

    #[must_use]
    pub fn has_key(&self, key: &str) -> bool {
        self.inner.borrow().position(key).is_some()
    }

    /// Keys in registration order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .borrow()
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Stop and drop the addressed probes. Returns how many were removed.
    pub fn remove<'a>(&self, scope: impl Into<Scope<'a>>) -> Result<usize, RegistryError> {
        let removed = match scope.into() {
            Scope::All => std::mem::take(&mut self.inner.borrow_mut().entries),
            Scope::Key(key) => {
                let mut inner = self.inner.borrow_mut();
                let Some(idx) = inner.position(key) else {
                    drop(inner);
                    return Err(missing(key));
                };
                vec![inner.entries.remove(idx)]
            }
        };
        for (_, probe) in &removed {
            probe.stop();
        }
        Ok(removed.len())
    }

    /// Point-in-time copy of the addressed probes.
    fn select(&self, scope: Scope<'_>) -> Result<Vec<Probe>, RegistryError> {
        match scope {
            Scope::All => Ok(self
                .inner
                .borrow()
                .entries
                .iter()
                .map(|(_, p)| p.clone())
                .collect()),
            Scope::Key(key) => self.get(key).map(|p| vec![p]).ok_or_else(|| missing(key)),
        }
    }

    // --- callbacks ---

    pub fn set_primary<'a>(
        &self,
        scope: impl Into<Scope<'a>>,
        callback: Callback,
    ) -> Result<(), RegistryError> {
        for probe in self.select(scope.into())? {
            probe.set_primary(callback.clone());
        }
        Ok(())
    }

    /// Attach `callback` to the addressed probes, one handle per probe.
    ///
    /// With `start`, stopped probes are restarted (unless synchronous).
    pub fn add_func<'a>(
        &self,
        scope: impl Into<Scope<'a>>,
        callback: Callback,
        start: bool,
    ) -> Result<Vec<CallbackHandle>, RegistryError> {
        let probes = self.select(scope.into())?;
        let sync = self.is_synchronous();
        let mut handles = Vec::with_capacity(probes.len());
        for probe in probes {
            handles.push(probe.add_func(callback.clone()));
            if start && !sync {
                probe.start();
            }
        }
        Ok(handles)
    }

    /// Remove one callback (or all with `None`) from the addressed probes.
    ///
    /// A probe is stopped when `stop` is set or it has no callbacks left.
    pub fn remove_funcs<'a>(
        &self,
        scope: impl Into<Scope<'a>>,
        handle: Option<CallbackHandle>,
        stop: bool,
    ) -> Result<(), RegistryError> {
        for probe in self.select(scope.into())? {
            probe.remove_funcs(handle);
            if stop || !probe.has_callbacks() {
                probe.stop();
            }
        }
        Ok(())
    }

    pub fn funcs(&self, key: &str) -> Result<Vec<CallbackHandle>, RegistryError> {
        self.get(key).map(|p| p.funcs()).ok_or_else(|| missing(key))
    }

    // --- lifecycle ---

    /// Start per-probe loops, leaving synchronous mode first.
    pub fn start<'a>(&self, scope: impl Into<Scope<'a>>) -> Result<(), RegistryError> {
        self.stop_sync();
        for probe in self.select(scope.into())? {
            probe.start();
        }
        Ok(())
    }

    /// Stop per-probe loops, leaving synchronous mode first.
    pub fn stop<'a>(&self, scope: impl Into<Scope<'a>>) -> Result<(), RegistryError> {
        self.stop_sync();
        for probe in self.select(scope.into())? {
            probe.stop();
        }
        Ok(())
    }

    pub fn set_interval<'a>(
        &self,
        scope: impl Into<Scope<'a>>,
        interval: PollInterval,
    ) -> Result<(), RegistryError> {
        for probe in self.select(scope.into())? {
            probe.set_interval(interval);
        }
        Ok(())
    }

    /// Change the cadence of every registered probe.
    pub fn set_interval_all(&self, interval: PollInterval) {
        for probe in self.select(Scope::All).unwrap_or_default() {
            probe.set_interval(interval);
        }
    }

    pub fn invalidate<'a>(&self, scope: impl Into<Scope<'a>>) -> Result<(), RegistryError> {
        for probe in self.select(scope.into())? {
            probe.invalidate();
        }
        Ok(())
    }

    /// Check every probe once. Returns how many reported a change.
    pub fn check_all(&self) -> usize {
        let probes = self.select(Scope::All).unwrap_or_default();
        probes.iter().filter(|probe| probe.check()).count()
    }

    /// Drain callback failures from every probe.
    pub fn take_failures(&self) -> Vec<CallbackFailure> {
        let probes = self.select(Scope::All).unwrap_or_default();
        probes.iter().flat_map(Probe::take_failures).collect()
    }

    // --- synchronous mode ---

    #[must_use]
    pub fn is_synchronous(&self) -> bool {
        self.inner.borrow().sync.is_some()
    }

    /// Stop every per-probe loop and check all probes from one shared loop.
    ///
    /// Already synchronous: only the interval changes.
    pub fn start_sync(&self, interval: PollInterval) {
        let interval = interval.clamped();
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(sync) = inner.sync.as_mut() {
                sync.interval = interval;
                return;
            }
            inner.sync = Some(SyncLoop {
                interval,
                pending: None,
            });
        }
        for probe in self.select(Scope::All).unwrap_or_default() {
            probe.stop();
        }
        debug!(interval = %interval, probes = self.len(), "registry.sync.start");
        self.arm_sync();
    }

    /// Cancel the shared loop. Probes stay stopped.
    pub fn stop_sync(&self) {
        let (pending, scheduler) = {
            let mut inner = self.inner.borrow_mut();
            let Some(sync) = inner.sync.take() else { return };
            (sync.pending, Rc::clone(&inner.scheduler))
        };
        if let Some(id) = pending {
            scheduler.cancel(id);
        }
        debug!("registry.sync.stop");
    }

    fn arm_sync(&self) {
        let (scheduler, interval) = {
            let inner = self.inner.borrow();
            match &inner.sync {
                Some(sync) if sync.pending.is_none() => (Rc::clone(&inner.scheduler), sync.interval),
                _ => return,
            }
        };
        let weak: Weak<RefCell<RegistryInner>> = Rc::downgrade(&self.inner);
        let id = interval.schedule(
            &*scheduler,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                let registry = ProbeRegistry { inner };
                {
                    let mut inner = registry.inner.borrow_mut();
                    match inner.sync.as_mut() {
                        Some(sync) => sync.pending = None,
                        None => return,
                    }
                }
                registry.check_all();
                registry.arm_sync();
            }),
        );
        if let Some(sync) = self.inner.borrow_mut().sync.as_mut() {
            sync.pending = Some(id);
        }
    }
}

fn missing(key: &str) -> RegistryError {
    warn!(key = %key, "no probe registered under key");
    RegistryError::MissingKey {
        key: key.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
