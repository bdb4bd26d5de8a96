#![forbid(unsafe_code)]

//! E2E tests for the state store's three channels.
//!
//! Validates that:
//! 1. Batched writes commit on the next tick, with append-mode merging.
//! 2. Sequential subscribers see every logged write; snapshot subscribers see
//!    net changes only.
//! 3. Triggers commit and fire synchronously.
//! 4. `remove_state` forgets every subscription for a key.
//! 5. Stopped and synchronous per-key probes behave as documented.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tickwatch_core::clock::{Clock, LabClock};
use tickwatch_core::scheduler::HEADLESS_FRAME;
use tickwatch_core::{CallbackError, FrameSource, LocalScheduler, Record, Scheduler, Value};
use tickwatch_probe::{Callback, CallbackHandle, PollInterval};
use tickwatch_store::{STATE_ADDED, STATE_REMOVED, StateStore, StoreConfig};
use web_time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn setup(config: StoreConfig) -> (Rc<LocalScheduler>, StateStore) {
    let scheduler = Rc::new(LocalScheduler::new(
        FrameSource::Headless,
        Clock::Lab(LabClock::new()),
    ));
    let store = StateStore::new(
        Record::new(),
        config,
        Rc::clone(&scheduler) as Rc<dyn Scheduler>,
    );
    (scheduler, store)
}

fn tick(scheduler: &LocalScheduler) {
    scheduler.advance(HEADLESS_FRAME);
}

fn counter() -> (Rc<Cell<u32>>, Callback) {
    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    (hits, Callback::new(move |_| h.set(h.get() + 1)))
}

fn recorder() -> (Rc<RefCell<Vec<Value>>>, Callback) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    (seen, Callback::new(move |v| s.borrow_mut().push(v.clone())))
}

fn numbers(value: &Value) -> Vec<f64> {
    value
        .as_sequence()
        .map(|s| s.borrow().iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

// ============================================================================
// Batched channel
// ============================================================================

#[test]
fn set_state_commits_on_next_tick() {
    let (scheduler, store) = setup(StoreConfig::default());
    let pending = store.set_state([("a", Value::from(1))], false).unwrap();

    assert!(!store.contains("a"));
    assert!(pending.borrow().contains_key("a"));

    tick(&scheduler);
    let state = store.get_state().unwrap();
    assert_eq!(state.property("a").unwrap().and_then(|v| v.as_f64()), Some(1.0));
    assert!(store.pending().borrow().is_empty());
    assert!(store.last_commit_stamp().is_some());
}

#[test]
fn append_mode_concatenates_between_ticks() {
    let (scheduler, store) = setup(StoreConfig::default());
    let xs = |items: &[i32]| Value::sequence(items.iter().map(|n| Value::from(*n)));
    store.set_state([("xs", xs(&[1, 2]))], true).unwrap();
    store.set_state([("xs", xs(&[3]))], true).unwrap();
    tick(&scheduler);
    assert_eq!(numbers(&store.get("xs").unwrap()), vec![1.0, 2.0, 3.0]);
}

#[test]
fn replace_mode_keeps_last_write() {
    let (scheduler, store) = setup(StoreConfig::default());
    store.set_state([("a", Value::from(1))], false).unwrap();
    store.set_state([("a", Value::from(2))], false).unwrap();
    tick(&scheduler);
    assert_eq!(store.get("a").and_then(|v| v.as_f64()), Some(2.0));
}

#[test]
fn payload_is_detached_from_caller() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (seen, cb) = recorder();
    store.subscribe_sequential("cfg", cb).unwrap();

    let payload = Value::record([("depth", Value::from(1))]);
    store.set_state([("cfg", payload.clone())], false).unwrap();
    if let Some(rec) = payload.as_record() {
        rec.borrow_mut().insert("depth".into(), Value::from(99));
    }
    tick(&scheduler);

    let logged = seen.borrow()[0].clone();
    assert_eq!(logged.property("depth").unwrap().and_then(|v| v.as_f64()), Some(1.0));
    let committed = store.get("cfg").unwrap();
    assert_eq!(committed.property("depth").unwrap().and_then(|v| v.as_f64()), Some(1.0));
}

#[test]
fn get_state_returns_a_detached_copy() {
    let (scheduler, store) = setup(StoreConfig::default());
    store
        .set_state([("nested", Value::record([("n", Value::from(1))]))], false)
        .unwrap();
    tick(&scheduler);
    let copy = store.get_state().unwrap();
    if let Some(Value::Record(nested)) = copy.property("nested").unwrap() {
        nested.borrow_mut().insert("n".into(), Value::from(2));
    }
    let live = store.get("nested").unwrap();
    assert_eq!(live.property("n").unwrap().and_then(|v| v.as_f64()), Some(1.0));
}

#[test]
fn interval_change_applies_to_committers() {
    let (scheduler, store) = setup(StoreConfig::default());
    store.set_interval(PollInterval::millis(100));
    store.set_state([("a", Value::from(1))], false).unwrap();
    scheduler.advance(Duration::from_millis(50));
    assert!(!store.contains("a"));
    scheduler.advance(Duration::from_millis(50));
    assert!(store.contains("a"));
}

// ============================================================================
// Sequential vs snapshot
// ============================================================================

#[test]
fn sequential_fires_per_call_snapshot_per_net_change() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (snapshot_hits, snapshot) = counter();
    let (sequential_seen, sequential) = recorder();
    assert_eq!(store.subscribe("k", snapshot).unwrap(), CallbackHandle::Primary);
    store.subscribe_sequential("k", sequential).unwrap();

    store.set_state([("k", Value::from(5))], false).unwrap();
    store.set_state([("k", Value::from(5))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    tick(&scheduler);

    let seen: Vec<f64> = sequential_seen.borrow().iter().filter_map(Value::as_f64).collect();
    assert_eq!(seen, vec![5.0, 5.0]);
    assert_eq!(snapshot_hits.get(), 1);
    assert_eq!(store.log_len(), 0);
}

#[test]
fn sequential_preserves_call_order() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (seen, cb) = recorder();
    store.subscribe_sequential("n", cb).unwrap();
    for n in 0..30i32 {
        store.set_state([("n", Value::from(n))], false).unwrap();
    }
    tick(&scheduler);
    let got: Vec<f64> = seen.borrow().iter().filter_map(Value::as_f64).collect();
    assert_eq!(got, (0..30i32).map(f64::from).collect::<Vec<_>>());
}

#[test]
fn entries_logged_during_drain_arrive_next_tick() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (echo_hits, echo) = counter();
    store.subscribe_sequential("echo", echo).unwrap();

    let handle = store.clone();
    let fired = Rc::new(Cell::new(false));
    let f = Rc::clone(&fired);
    store
        .subscribe_sequential(
            "k",
            Callback::new(move |_| {
                if !f.replace(true) {
                    let _ = handle.set_sequential_state([("echo", Value::from(true))]);
                }
            }),
        )
        .unwrap();

    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    assert!(fired.get());
    assert_eq!(echo_hits.get(), 0);
    assert_eq!(store.log_len(), 1);
    tick(&scheduler);
    assert_eq!(echo_hits.get(), 1);
    assert_eq!(store.log_len(), 0);
    store.unsubscribe_all_sequential("k");
}

#[test]
fn structural_entries_announce_adds_and_removes() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (added, on_add) = recorder();
    let (removed, on_remove) = recorder();
    store.subscribe_sequential(STATE_ADDED, on_add).unwrap();
    store.subscribe_sequential(STATE_REMOVED, on_remove).unwrap();
    assert!(!store.contains(STATE_ADDED));

    store.add_to_state("x", Value::from(1), None).unwrap();
    assert!(store.contains("x"));
    store.remove_state("x").unwrap();
    tick(&scheduler);

    assert_eq!(added.borrow()[0].as_str(), Some("x"));
    assert_eq!(removed.borrow()[0].as_str(), Some("x"));
}

#[test]
fn unsubscribe_sequential_by_handle() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, cb) = counter();
    let handle = store.subscribe_sequential("k", cb).unwrap();
    assert!(store.unsubscribe_sequential("k", handle));
    assert!(!store.unsubscribe_sequential("k", handle));
    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    assert_eq!(hits.get(), 0);
}

#[test]
fn failing_sequential_subscriber_is_collected() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, after) = counter();
    store
        .subscribe_sequential("k", Callback::fallible(|_| Err(CallbackError::failed("bad"))))
        .unwrap();
    store.subscribe_sequential("k", after).unwrap();
    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);

    assert_eq!(hits.get(), 1);
    let failures = store.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].probe, "sequential:k");
    assert!(store.take_failures().is_empty());
}

// ============================================================================
// Trigger channel
// ============================================================================

#[test]
fn trigger_commits_synchronously() {
    let (_scheduler, store) = setup(StoreConfig::default());
    let (seen, cb) = recorder();
    store.subscribe_trigger("t", cb);

    let pending = store
        .set_state([("t", Value::from(9)), ("other", Value::from(1))], false)
        .unwrap();

    assert_eq!(store.get("t").and_then(|v| v.as_f64()), Some(9.0));
    assert_eq!(seen.borrow()[0].as_f64(), Some(9.0));
    assert!(!pending.borrow().contains_key("t"));
    assert!(pending.borrow().contains_key("other"));
    assert!(!store.contains("other"));
    assert!(store.last_commit_stamp().is_some());
}

#[test]
fn unsubscribed_trigger_falls_back_to_batching() {
    let (_scheduler, store) = setup(StoreConfig::default());
    let handle = store.subscribe_trigger("t", Callback::noop());
    assert!(store.unsubscribe_trigger("t", handle));
    store.set_state([("t", Value::from(1))], false).unwrap();
    assert!(!store.contains("t"));
}

// ============================================================================
// Removal and lifecycle
// ============================================================================

#[test]
fn remove_state_forgets_every_subscription() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (snap, on_snap) = counter();
    let (seq, on_seq) = counter();
    let (trig, on_trig) = counter();
    store.subscribe("k", on_snap).unwrap();
    store.subscribe_sequential("k", on_seq).unwrap();
    store.subscribe_trigger("k", on_trig);
    store.set_state([("staged", Value::from(0))], false).unwrap();

    store.remove_state("k").unwrap();
    assert!(!store.contains("k"));
    assert!(store.key_sub_callbacks("k").is_err());

    assert_eq!(store.subscribe("k", Callback::noop()).unwrap(), CallbackHandle::Primary);
    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!((snap.get(), seq.get(), trig.get()), (0, 0, 0));
    assert_eq!(store.get("k").and_then(|v| v.as_f64()), Some(1.0));
}

#[test]
fn subscribe_existing_key_adds_secondary() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, cb) = counter();
    store.add_to_state("k", Value::from(0), None).unwrap();
    let handle = store.subscribe("k", cb).unwrap();
    assert_eq!(handle, CallbackHandle::Secondary(0));
    assert_eq!(store.key_sub_callbacks("k").unwrap(), vec![handle]);

    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!(hits.get(), 1);

    store.unsubscribe("k", handle).unwrap();
    assert!(store.key_sub_callbacks("k").unwrap().is_empty());
}

#[test]
fn resubscribe_after_unsubscribe_fires() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (first_hits, first) = counter();
    let (second_hits, second) = counter();
    let handle = store.subscribe("k", first).unwrap();
    store.unsubscribe("k", handle).unwrap();
    store.subscribe("k", second).unwrap();

    store.set_state([("k", Value::from(7))], false).unwrap();
    for _ in 0..5 {
        tick(&scheduler);
    }
    assert_eq!(store.get("k").and_then(|v| v.as_f64()), Some(7.0));
    assert_eq!((first_hits.get(), second_hits.get()), (0, 1));
}

#[test]
fn new_primary_restarts_a_stopped_key() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, cb) = counter();
    store.subscribe("k", Callback::noop()).unwrap();
    store.stop(Some("k")).unwrap();
    store.set_primary_key_response("k", cb).unwrap();

    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!(hits.get(), 1);
}

#[test]
fn subscribe_after_direct_delete_keeps_first_subscriber() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (first_hits, first) = counter();
    let (second_hits, second) = counter();
    assert_eq!(store.subscribe("k", first).unwrap(), CallbackHandle::Primary);
    store.record().borrow_mut().shift_remove("k");

    let handle = store.subscribe("k", second).unwrap();
    assert_eq!(handle, CallbackHandle::Secondary(0));
    assert!(store.contains("k"));

    store.set_state([("k", Value::from(7))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!((first_hits.get(), second_hits.get()), (1, 1));
}

#[test]
fn add_to_state_with_callback_subscribes() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, cb) = counter();
    let handle = store.add_to_state("k", Value::from(0), Some(cb)).unwrap();
    assert_eq!(handle, Some(CallbackHandle::Secondary(0)));
    store.set_state([("k", Value::from(3))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!(hits.get(), 1);
}

#[test]
fn update_state_overwrites_or_adds() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (added, on_add) = recorder();
    store.subscribe_sequential(STATE_ADDED, on_add).unwrap();

    store.update_state("fresh", Value::from(1)).unwrap();
    store.update_state("fresh", Value::from(2)).unwrap();
    assert_eq!(store.get("fresh").and_then(|v| v.as_f64()), Some(2.0));
    tick(&scheduler);
    assert_eq!(added.borrow().len(), 1);
}

#[test]
fn stop_silences_snapshot_subscribers_until_start() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (hits, cb) = counter();
    store.subscribe("k", cb).unwrap();
    store.stop(None).unwrap();

    for n in 1..5i32 {
        store.set_state([("k", Value::from(n))], false).unwrap();
        tick(&scheduler);
    }
    assert_eq!(hits.get(), 0);
    assert_eq!(store.get("k").and_then(|v| v.as_f64()), Some(4.0));

    store.start(Some("k")).unwrap();
    tick(&scheduler);
    assert_eq!(hits.get(), 1);
}

#[test]
fn auto_start_off_creates_stopped_probes() {
    let (scheduler, store) = setup(StoreConfig::default().auto_start(false));
    let (hits, cb) = counter();
    store.subscribe("k", cb).unwrap();
    store.set_state([("k", Value::from(1))], false).unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!(hits.get(), 0);
    store.start(None).unwrap();
    tick(&scheduler);
    assert_eq!(hits.get(), 1);
}

#[test]
fn synchronous_listeners_check_every_key_from_one_loop() {
    let (scheduler, store) = setup(StoreConfig::default());
    let (a_hits, on_a) = counter();
    let (b_hits, on_b) = counter();
    store.subscribe("a", on_a).unwrap();
    store.run_synchronous_listeners();
    store.subscribe("b", on_b).unwrap();
    assert!(!store.config().auto_start);

    store
        .set_state([("a", Value::from(1)), ("b", Value::from(1))], false)
        .unwrap();
    tick(&scheduler);
    tick(&scheduler);
    assert_eq!((a_hits.get(), b_hits.get()), (1, 1));
}

#[test]
fn clear_all_key_responses_drops_probes_but_keeps_keys() {
    let (_scheduler, store) = setup(StoreConfig::default());
    store.subscribe("a", Callback::noop()).unwrap();
    store.subscribe("b", Callback::noop()).unwrap();
    assert_eq!(store.clear_all_key_responses(None).unwrap(), 2);
    assert!(store.contains("a") && store.contains("b"));
    store.unsubscribe_all("a").unwrap();
    assert!(!store.contains("a"));
}
