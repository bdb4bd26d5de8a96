#![forbid(unsafe_code)]

//! Bounded, cycle-safe snapshot codec.
//!
//! [`SnapshotCodec::fingerprint`] renders a [`Value`] into a short JSON text
//! used purely for change comparison. The rendering is bounded:
//!
//! - sequences longer than the window (20) keep only their last 20 elements;
//! - opaque objects render as `instanceof_<kind>` and are never walked;
//! - containers nested at or below `max_depth` render as
//!   `instanceof_Record` / `instanceof_Sequence`;
//! - callables render as their source text;
//! - a node reached a second time renders as
//!   `[Circular Reference]<path>`, naming the path where it was first seen.
//!
//! [`SnapshotCodec::deep_copy`] is the non-deduplicating variant: it detaches
//! a payload from the caller's nodes, keeps shared (non-cyclic) repeats, does
//! no truncation or kind collapsing, and only breaks true cycles.
//!
//! # Invariants
//!
//! 1. Fingerprinting always terminates, including on cyclic graphs.
//! 2. The codec holds no state besides its [`CodecConfig`]; all recursion
//!    bookkeeping is local to one call.
//!
//! # Failure Modes
//!
//! - **Node mutably borrowed**: [`SnapshotCodec::fingerprint`] logs a warning
//!   and returns [`Fingerprint::Undefined`], which probes treat as "no change".

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Number, Value as Json};
use tracing::warn;

use crate::error::FingerprintError;
use crate::value::{Primitive, Record, RecordRef, SeqRef, Shape, Value};

/// Number of trailing sequence elements kept in a fingerprint.
pub const SEQUENCE_WINDOW: usize = 20;

/// Container nesting depth at which records and sequences collapse.
pub const MAX_DEPTH: usize = 3;

/// Prefix of the marker rendered for a repeated or cyclic node.
pub const CIRCULAR_MARKER: &str = "[Circular Reference]";

const ROOT_PATH: &str = "this";

/// Comparable rendering of a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Text(String),
    /// Fingerprinting failed; never considered a change.
    Undefined,
}

impl Fingerprint {
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Undefined => None,
        }
    }
}

/// Bounds applied while fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Trailing sequence elements kept.
    pub window: usize,
    /// Nesting depth at which containers collapse to a kind marker.
    pub max_depth: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            window: SEQUENCE_WINDOW,
            max_depth: MAX_DEPTH,
        }
    }
}

/// Stateless fingerprint and copy service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotCodec {
    config: CodecConfig,
}

impl SnapshotCodec {
    #[must_use]
    pub const fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> CodecConfig {
        self.config
    }

    /// Fingerprint `value`, logging and returning [`Fingerprint::Undefined`]
    /// on failure.
    #[must_use]
    pub fn fingerprint(&self, value: &Value) -> Fingerprint {
        match self.try_fingerprint(value) {
            Ok(text) => Fingerprint::Text(text),
            Err(err) => {
                warn!(error = %err, "fingerprint failed; treating as unchanged");
                Fingerprint::Undefined
            }
        }
    }

    /// Fingerprint `value`, surfacing the failure.
    pub fn try_fingerprint(&self, value: &Value) -> Result<String, FingerprintError> {
        let json = self.reduce_json(value)?;
        Ok(serde_json::to_string(&json)?)
    }

    /// The bounded tree a fingerprint is serialized from.
    pub fn reduce_json(&self, value: &Value) -> Result<Json, FingerprintError> {
        Reducer::new(&self.config).walk(value, 0)
    }

    /// The bounded tree as a detached [`Value`].
    ///
    /// Mutating the result never affects `value`.
    pub fn reduce(&self, value: &Value) -> Result<Value, FingerprintError> {
        Ok(from_json(self.reduce_json(value)?))
    }

    /// Detached deep copy of `value`, breaking only true cycles.
    pub fn deep_copy(&self, value: &Value) -> Result<Value, FingerprintError> {
        Copier::default().walk(value)
    }
}

/// Convert parsed JSON back into a value tree.
#[must_use]
pub fn from_json(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::sequence(items.into_iter().map(from_json)),
        Json::Object(map) => Value::record(map.into_iter().map(|(k, v)| (k, from_json(v)))),
    }
}

fn node_id<T: ?Sized>(node: &Rc<T>) -> *const () {
    Rc::as_ptr(node).cast()
}

fn primitive_json(p: Primitive) -> Json {
    match p {
        Primitive::Null => Json::Null,
        Primitive::Bool(b) => Json::Bool(b),
        Primitive::Number(n) => Number::from_f64(n).map_or(Json::Null, Json::Number),
        Primitive::Text(s) => Json::String(s),
    }
}

fn circular(path: &str) -> String {
    format!("{CIRCULAR_MARKER}{path}")
}

// ---------------------------------------------------------------------------
// Bounded reduction
// ---------------------------------------------------------------------------

struct Reducer<'c> {
    config: &'c CodecConfig,
    seen: HashMap<*const (), String>,
    path: Vec<String>,
}

impl<'c> Reducer<'c> {
    fn new(config: &'c CodecConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            path: vec![ROOT_PATH.to_string()],
        }
    }

    fn current_path(&self) -> String {
        self.path.join(".")
    }

    fn borrowed(&self) -> FingerprintError {
        FingerprintError::Borrowed {
            path: self.current_path(),
        }
    }

    /// First sighting registers the node; later sightings return the marker.
    fn visit(&mut self, id: *const ()) -> Option<Json> {
        if let Some(first) = self.seen.get(&id) {
            return Some(Json::String(circular(first)));
        }
        self.seen.insert(id, self.current_path());
        None
    }

    fn walk(&mut self, value: &Value, depth: usize) -> Result<Json, FingerprintError> {
        match value.shape() {
            Shape::Primitive(p) => Ok(primitive_json(p)),
            Shape::Opaque(kind) => Ok(Json::String(format!("instanceof_{kind}"))),
            Shape::Callable(source) => Ok(Json::String(source.to_string())),
            Shape::Sequence(seq) => {
                if depth >= self.config.max_depth {
                    return Ok(Json::String("instanceof_Sequence".into()));
                }
                if let Some(marker) = self.visit(node_id(seq)) {
                    return Ok(marker);
                }
                let items = seq.try_borrow().map_err(|_| self.borrowed())?;
                let start = items.len().saturating_sub(self.config.window);
                let mut out = Vec::with_capacity(items.len() - start);
                for (i, item) in items.iter().enumerate().skip(start) {
                    self.path.push(i.to_string());
                    let walked = self.walk(item, depth + 1);
                    self.path.pop();
                    out.push(walked?);
                }
                Ok(Json::Array(out))
            }
            Shape::Record(rec) => {
                if depth >= self.config.max_depth {
                    return Ok(Json::String("instanceof_Record".into()));
                }
                if let Some(marker) = self.visit(node_id(rec)) {
                    return Ok(marker);
                }
                let entries = rec.try_borrow().map_err(|_| self.borrowed())?;
                let mut out = Map::new();
                for (key, item) in entries.iter() {
                    self.path.push(key.clone());
                    let walked = self.walk(item, depth + 1);
                    self.path.pop();
                    out.insert(key.clone(), walked?);
                }
                Ok(Json::Object(out))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Copier {
    /// Nodes on the current path, with the path where each was entered.
    ancestors: Vec<(*const (), String)>,
    path: Vec<String>,
}

impl Copier {
    fn current_path(&self) -> String {
        let mut path = ROOT_PATH.to_string();
        for segment in &self.path {
            path.push('.');
            path.push_str(segment);
        }
        path
    }

    fn enter(&mut self, id: *const ()) -> Option<Value> {
        if let Some((_, first)) = self.ancestors.iter().find(|(a, _)| *a == id) {
            return Some(Value::Text(circular(first)));
        }
        self.ancestors.push((id, self.current_path()));
        None
    }

    fn walk(&mut self, value: &Value) -> Result<Value, FingerprintError> {
        match value {
            Value::Sequence(seq) => {
                if let Some(marker) = self.enter(node_id(seq)) {
                    return Ok(marker);
                }
                let copied = self.copy_sequence(seq);
                self.ancestors.pop();
                copied
            }
            Value::Record(rec) => {
                if let Some(marker) = self.enter(node_id(rec)) {
                    return Ok(marker);
                }
                let copied = self.copy_record(rec);
                self.ancestors.pop();
                copied
            }
            other => Ok(other.clone()),
        }
    }

    fn copy_sequence(&mut self, seq: &SeqRef) -> Result<Value, FingerprintError> {
        let items = seq.try_borrow().map_err(|_| FingerprintError::Borrowed {
            path: self.current_path(),
        })?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            self.path.push(i.to_string());
            let copied = self.walk(item);
            self.path.pop();
            out.push(copied?);
        }
        Ok(Value::sequence(out))
    }

    fn copy_record(&mut self, rec: &RecordRef) -> Result<Value, FingerprintError> {
        let entries = rec.try_borrow().map_err(|_| FingerprintError::Borrowed {
            path: self.current_path(),
        })?;
        let mut out = Record::with_capacity(entries.len());
        for (key, item) in entries.iter() {
            self.path.push(key.clone());
            let copied = self.walk(item);
            self.path.pop();
            out.insert(key.clone(), copied?);
        }
        Ok(Value::from(out))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
