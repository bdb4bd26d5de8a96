//! Folding staged writes into the pending merge.
//!
//! A plain fold replaces each key. In append mode, a key present on both
//! sides merges instead:
//!
//! - two sequences concatenate, pending first;
//! - two records merge key by key, recursively, through [`APPEND_DEPTH`]
//!   record levels. Keys only present on the pending side are kept;
//! - anything else is replaced by the incoming value.

use tickwatch_core::{Record, Value};

/// Record levels merged recursively in append mode.
pub const APPEND_DEPTH: usize = 3;

/// Fold `incoming` into `pending`.
pub fn fold(pending: &mut Record, incoming: Record, append: bool) {
    for (key, value) in incoming {
        let value = match pending.get(&key) {
            Some(existing) if append => merge_value(existing, value, 1),
            _ => value,
        };
        pending.insert(key, value);
    }
}

fn merge_value(existing: &Value, incoming: Value, depth: usize) -> Value {
    match (existing, &incoming) {
        (Value::Sequence(old), Value::Sequence(new)) => {
            let joined: Vec<Value> = old.borrow().iter().chain(new.borrow().iter()).cloned().collect();
            Value::from(joined)
        }
        (Value::Record(old), Value::Record(new)) if depth <= APPEND_DEPTH => {
            let old = old.borrow();
            let mut merged = old.clone();
            for (key, value) in new.borrow().iter() {
                let value = match old.get(key) {
                    Some(prev) => merge_value(prev, value.clone(), depth + 1),
                    None => value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::from(merged)
        }
        _ => incoming,
    }
}
