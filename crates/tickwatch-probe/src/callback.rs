//! Subscriber callbacks and ordered callback lists.
//!
//! A [`Callback`] is a shared, mutable closure. Cloning it shares the closure,
//! so a list can hand out point-in-time copies for fan-out without holding any
//! borrow of the list itself.
//!
//! # Failure Modes
//!
//! - **Callback re-entered while running**: the inner invocation returns
//!   [`CallbackError::Reentrant`] instead of panicking on the `RefCell`.
//! - **Callback panics**: not caught. Only `Err` returns are isolated by
//!   [`invoke_all`]; a panic unwinds through the scheduler task and the
//!   remaining callbacks of that fan-out do not run.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tickwatch_core::{CallbackError, Value};
use tracing::warn;

type CallbackFn = dyn FnMut(&Value) -> Result<(), CallbackError>;

/// A subscriber closure receiving the value that changed.
#[derive(Clone)]
pub struct Callback(Rc<RefCell<CallbackFn>>);

impl Callback {
    /// Wrap an infallible closure.
    pub fn new(mut f: impl FnMut(&Value) + 'static) -> Self {
        Self::fallible(move |value| {
            f(value);
            Ok(())
        })
    }

    /// Wrap a closure that may report failure.
    pub fn fallible(f: impl FnMut(&Value) -> Result<(), CallbackError> + 'static) -> Self {
        Self(Rc::new(RefCell::new(f)))
    }

    /// A callback that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Invoke the closure with `value`.
    pub fn invoke(&self, value: &Value) -> Result<(), CallbackError> {
        let Ok(mut f) = self.0.try_borrow_mut() else {
            return Err(CallbackError::Reentrant);
        };
        (*f)(value)
    }

    /// Whether both handles share one closure.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback")
            .field(&Rc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// Identifies one callback attached to a probe or channel.
///
/// Secondary handles are registration positions. They never shift when an
/// earlier callback is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallbackHandle {
    Primary,
    Secondary(usize),
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary(n) => write!(f, "secondary#{n}"),
        }
    }
}

/// One callback invocation that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    /// Label of the probe or channel that fanned out.
    pub probe: String,
    pub handle: CallbackHandle,
    pub error: CallbackError,
}

/// Callbacks in registration order, keyed by stable handles.
#[derive(Debug, Clone, Default)]
pub struct CallbackList {
    entries: Vec<(usize, Callback)>,
    next: usize,
}

impl CallbackList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback`, returning its handle.
    pub fn push(&mut self, callback: Callback) -> CallbackHandle {
        let slot = self.next;
        self.next += 1;
        self.entries.push((slot, callback));
        CallbackHandle::Secondary(slot)
    }

    /// Remove one callback. Returns `false` if the handle is not present.
    pub fn remove(&mut self, handle: CallbackHandle) -> bool {
        let CallbackHandle::Secondary(slot) = handle else {
            return false;
        };
        let before = self.entries.len();
        self.entries.retain(|(s, _)| *s != slot);
        self.entries.len() < before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn handles(&self) -> Vec<CallbackHandle> {
        self.entries
            .iter()
            .map(|(slot, _)| CallbackHandle::Secondary(*slot))
            .collect()
    }

    /// Point-in-time copy for fan-out.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(CallbackHandle, Callback)> {
        self.entries
            .iter()
            .map(|(slot, cb)| (CallbackHandle::Secondary(*slot), cb.clone()))
            .collect()
    }
}

/// Invoke every callback in order, isolating failures.
///
/// A failing callback does not prevent later ones from running. Each failure
/// is logged and returned.
pub fn invoke_all(
    label: &str,
    callbacks: &[(CallbackHandle, Callback)],
    value: &Value,
) -> Vec<CallbackFailure> {
    let mut failures = Vec::new();
    for (handle, callback) in callbacks {
        if let Err(error) = callback.invoke(value) {
            warn!(probe = label, %handle, %error, "callback failed");
            failures.push(CallbackFailure {
                probe: label.to_string(),
                handle: *handle,
                error,
            });
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tracing_test::traced_test;

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Callback {
        let log = Rc::clone(log);
        Callback::new(move |_| log.borrow_mut().push(tag))
    }

    #[test]
    fn handles_are_stable_after_removal() {
        let mut list = CallbackList::new();
        let a = list.push(Callback::noop());
        let b = list.push(Callback::noop());
        let c = list.push(Callback::noop());
        assert_eq!(
            (a, b, c),
            (
                CallbackHandle::Secondary(0),
                CallbackHandle::Secondary(1),
                CallbackHandle::Secondary(2)
            )
        );
        assert!(list.remove(b));
        assert!(!list.remove(b));
        assert_eq!(list.handles(), vec![a, c]);
        let d = list.push(Callback::noop());
        assert_eq!(d, CallbackHandle::Secondary(3));
    }

    #[test]
    fn primary_handle_is_not_a_list_member() {
        let mut list = CallbackList::new();
        list.push(Callback::noop());
        assert!(!list.remove(CallbackHandle::Primary));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn invoke_all_runs_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = CallbackList::new();
        list.push(recorder(&log, "a"));
        list.push(recorder(&log, "b"));
        list.push(recorder(&log, "c"));
        let failures = invoke_all("test", &list.snapshot(), &Value::Null);
        assert!(failures.is_empty());
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    #[traced_test]
    fn failures_are_isolated_and_collected() {
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        let mut list = CallbackList::new();
        let bad = list.push(Callback::fallible(|_| Err(CallbackError::failed("boom"))));
        list.push(Callback::new(move |_| r.set(true)));

        let failures = invoke_all("probe-7", &list.snapshot(), &Value::from(1));
        assert!(ran.get());
        assert_eq!(
            failures,
            vec![CallbackFailure {
                probe: "probe-7".into(),
                handle: bad,
                error: CallbackError::failed("boom"),
            }]
        );
        assert!(logs_contain("callback failed"));
    }

    #[test]
    fn reentrant_invocation_reports_error() {
        let slot: Rc<RefCell<Option<Callback>>> = Rc::new(RefCell::new(None));
        let inner_result = Rc::new(RefCell::new(None));
        let s = Rc::clone(&slot);
        let out = Rc::clone(&inner_result);
        let cb = Callback::new(move |v| {
            let me = s.borrow().clone();
            if let Some(me) = me {
                *out.borrow_mut() = Some(me.invoke(v));
            }
        });
        *slot.borrow_mut() = Some(cb.clone());
        assert_eq!(cb.invoke(&Value::Null), Ok(()));
        assert_eq!(*inner_result.borrow(), Some(Err(CallbackError::Reentrant)));
    }

    #[test]
    #[should_panic(expected = "subscriber panicked")]
    fn panics_are_not_isolated() {
        let mut list = CallbackList::new();
        list.push(Callback::new(|_| panic!("subscriber panicked")));
        list.push(Callback::noop());
        let _ = invoke_all("test", &list.snapshot(), &Value::Null);
    }
}
