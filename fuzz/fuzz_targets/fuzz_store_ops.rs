#![no_main]

use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tickwatch_core::clock::{Clock, LabClock};
use tickwatch_core::scheduler::HEADLESS_FRAME;
use tickwatch_core::{FrameSource, LocalScheduler, Record, Scheduler, Value};
use tickwatch_probe::Callback;
use tickwatch_store::{StateStore, StoreConfig};

const KEYS: [&str; 4] = ["a", "b", "c", "d"];

#[derive(Arbitrary, Debug)]
enum Payload {
    Null,
    Number(i32),
    Text(String),
    List(Vec<i32>),
}

impl Payload {
    fn value(&self) -> Value {
        match self {
            Payload::Null => Value::Null,
            Payload::Number(n) => Value::from(*n),
            Payload::Text(s) => Value::Text(s.clone()),
            Payload::List(items) => Value::sequence(items.iter().copied().map(Value::from)),
        }
    }
}

#[derive(Arbitrary, Debug)]
enum Op {
    Add(u8, Payload),
    Set(u8, Payload, bool),
    Sequential(u8, Payload),
    Update(u8, Payload),
    Remove(u8),
    Subscribe(u8),
    SubscribeSequential(u8),
    SubscribeTrigger(u8),
    UnsubscribeAll(u8),
    Stop(Option<u8>),
    Start(Option<u8>),
    Sync,
    Tick,
}

fn key(k: u8) -> &'static str {
    KEYS[usize::from(k) % KEYS.len()]
}

fuzz_target!(|ops: Vec<Op>| {
    let scheduler = Rc::new(LocalScheduler::new(
        FrameSource::Headless,
        Clock::Lab(LabClock::new()),
    ));
    let store = StateStore::new(
        Record::new(),
        StoreConfig::default(),
        Rc::clone(&scheduler) as Rc<dyn Scheduler>,
    );

    for op in ops.iter().take(256) {
        match op {
            Op::Add(k, p) => {
                let _ = store.add_to_state(key(*k), p.value(), None);
            }
            Op::Set(k, p, append) => {
                let _ = store.set_state([(key(*k), p.value())], *append);
            }
            Op::Sequential(k, p) => {
                let _ = store.set_sequential_state([(key(*k), p.value())]);
            }
            Op::Update(k, p) => {
                let _ = store.update_state(key(*k), p.value());
            }
            Op::Remove(k) => {
                let _ = store.remove_state(key(*k));
            }
            Op::Subscribe(k) => {
                let _ = store.subscribe(key(*k), Callback::noop());
            }
            Op::SubscribeSequential(k) => {
                let _ = store.subscribe_sequential(key(*k), Callback::noop());
            }
            Op::SubscribeTrigger(k) => {
                store.subscribe_trigger(key(*k), Callback::noop());
            }
            Op::UnsubscribeAll(k) => {
                let _ = store.unsubscribe_all(key(*k));
                store.unsubscribe_all_sequential(key(*k));
                store.unsubscribe_all_triggers(key(*k));
            }
            Op::Stop(k) => {
                let _ = store.stop(k.map(key));
            }
            Op::Start(k) => {
                let _ = store.start(k.map(key));
            }
            Op::Sync => store.run_synchronous_listeners(),
            Op::Tick => {
                scheduler.advance(HEADLESS_FRAME);
            }
        }
    }

    for _ in 0..4 {
        scheduler.advance(HEADLESS_FRAME);
    }
    assert_eq!(store.log_len(), 0);
    assert!(store.pending().borrow().is_empty());
});
