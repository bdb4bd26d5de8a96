#![forbid(unsafe_code)]

//! Dynamic value model watched by probes.
//!
//! Watched state is a tree of [`Value`]s. Records and sequences are shared,
//! interior-mutable nodes (`Rc<RefCell<..>>`) so application code can mutate
//! them in place while a probe holds a weak reference to the same node.
//!
//! Every consumer (codec, probe equality) inspects a value through one
//! classification step, [`Value::shape`], instead of ad-hoc kind checks.

use std::cell::{BorrowError, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

/// Insertion-ordered key/value map.
pub type Record = IndexMap<String, Value>;

/// Shared handle to a record node.
pub type RecordRef = Rc<RefCell<Record>>;

/// Shared handle to a sequence node.
pub type SeqRef = Rc<RefCell<Vec<Value>>>;

/// A foreign object the engine must not introspect.
///
/// Opaque values fingerprint as `instanceof_<kind>`; their internals are never
/// walked.
pub trait Opaque {
    /// Kind name rendered in fingerprints.
    fn kind(&self) -> &str;
}

/// A function value with its source text.
///
/// The source text is what fingerprints compare, so two callables with the
/// same text are considered unchanged.
#[derive(Clone)]
pub struct Callable {
    source: Rc<str>,
    func: Rc<dyn Fn(&[Value]) -> Value>,
}

impl Callable {
    /// Wrap a function together with its source text.
    pub fn new(source: impl Into<Rc<str>>, func: impl Fn(&[Value]) -> Value + 'static) -> Self {
        Self {
            source: source.into(),
            func: Rc::new(func),
        }
    }

    /// Source text of the function.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Invoke the function.
    pub fn call(&self, args: &[Value]) -> Value {
        (self.func)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("source", &self.source)
            .finish()
    }
}

/// A dynamically-typed value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Sequence(SeqRef),
    Record(RecordRef),
    Opaque(Rc<dyn Opaque>),
    Callable(Callable),
}

/// Scalar values compared by direct equality.
#[derive(Debug, Clone)]
pub enum Primitive {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            // NaN compares equal to itself so a NaN-valued key does not
            // report a change on every tick.
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// Result of classifying a [`Value`].
#[derive(Debug)]
pub enum Shape<'a> {
    Primitive(Primitive),
    Sequence(&'a SeqRef),
    Record(&'a RecordRef),
    /// Opaque object, carrying its kind name.
    Opaque(&'a str),
    /// Callable, carrying its source text.
    Callable(&'a str),
}

impl Value {
    /// Build a fresh record node.
    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Record(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    /// Build a fresh sequence node.
    pub fn sequence(items: impl IntoIterator<Item = Value>) -> Self {
        Self::Sequence(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    /// Wrap a foreign object.
    pub fn opaque(object: impl Opaque + 'static) -> Self {
        Self::Opaque(Rc::new(object))
    }

    /// Classify this value.
    #[must_use]
    pub fn shape(&self) -> Shape<'_> {
        match self {
            Self::Null => Shape::Primitive(Primitive::Null),
            Self::Bool(b) => Shape::Primitive(Primitive::Bool(*b)),
            Self::Number(n) => Shape::Primitive(Primitive::Number(*n)),
            Self::Text(s) => Shape::Primitive(Primitive::Text(s.clone())),
            Self::Sequence(seq) => Shape::Sequence(seq),
            Self::Record(rec) => Shape::Record(rec),
            Self::Opaque(obj) => Shape::Opaque(obj.kind()),
            Self::Callable(c) => Shape::Callable(c.source()),
        }
    }

    /// Kind name used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Sequence(_) => "sequence",
            Self::Record(_) => "record",
            Self::Opaque(_) => "opaque",
            Self::Callable(_) => "callable",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&RecordRef> {
        match self {
            Self::Record(rec) => Some(rec),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sequence(&self) -> Option<&SeqRef> {
        match self {
            Self::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    /// Whether both values are the same shared node (or equal primitives).
    #[must_use]
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Sequence(a), Self::Sequence(b)) => Rc::ptr_eq(a, b),
            (Self::Record(a), Self::Record(b)) => Rc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => Rc::ptr_eq(a, b),
            (Self::Callable(a), Self::Callable(b)) => Rc::ptr_eq(&a.func, &b.func),
            _ => match (self.shape(), other.shape()) {
                (Shape::Primitive(a), Shape::Primitive(b)) => a == b,
                _ => false,
            },
        }
    }

    /// Read one property: a record key, or a decimal index into a sequence.
    ///
    /// Missing properties read as `None`. Fails only if the node is currently
    /// mutably borrowed.
    pub fn property(&self, key: &str) -> Result<Option<Value>, BorrowError> {
        match self {
            Self::Record(rec) => Ok(rec.try_borrow()?.get(key).cloned()),
            Self::Sequence(seq) => {
                let seq = seq.try_borrow()?;
                Ok(key.parse::<usize>().ok().and_then(|i| seq.get(i).cloned()))
            }
            _ => Ok(None),
        }
    }

    /// Weak handle to this node, if it is a reference value.
    #[must_use]
    pub fn downgrade(&self) -> Option<WeakValue> {
        match self {
            Self::Record(rec) => Some(WeakValue::Record(Rc::downgrade(rec))),
            Self::Sequence(seq) => Some(WeakValue::Sequence(Rc::downgrade(seq))),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            // Shared nodes may be cyclic; print identity, not contents.
            Self::Sequence(seq) => match seq.try_borrow() {
                Ok(items) => write!(f, "Sequence(len={})", items.len()),
                Err(_) => f.write_str("Sequence(<borrowed>)"),
            },
            Self::Record(rec) => match rec.try_borrow() {
                Ok(map) => write!(f, "Record(keys={:?})", map.keys().collect::<Vec<_>>()),
                Err(_) => f.write_str("Record(<borrowed>)"),
            },
            Self::Opaque(obj) => write!(f, "Opaque({})", obj.kind()),
            Self::Callable(c) => fmt::Debug::fmt(c, f),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Callable> for Value {
    fn from(c: Callable) -> Self {
        Self::Callable(c)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::sequence(items)
    }
}

impl From<Record> for Value {
    fn from(rec: Record) -> Self {
        Self::Record(Rc::new(RefCell::new(rec)))
    }
}

/// Non-owning handle to a reference node.
#[derive(Debug, Clone)]
pub enum WeakValue {
    Record(Weak<RefCell<Record>>),
    Sequence(Weak<RefCell<Vec<Value>>>),
}

impl WeakValue {
    /// The node, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Value> {
        match self {
            Self::Record(w) => w.upgrade().map(Value::Record),
            Self::Sequence(w) => w.upgrade().map(Value::Sequence),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
