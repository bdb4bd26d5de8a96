#![forbid(unsafe_code)]

//! Core: value model, snapshot codec, clocks, and the scheduler capability.

pub mod clock;
pub mod codec;
pub mod error;
pub mod scheduler;
pub mod value;

pub use clock::{Clock, LabClock, unix_millis};
pub use codec::{CodecConfig, Fingerprint, SnapshotCodec};
pub use error::{CallbackError, ConstructionError, FingerprintError};
pub use scheduler::{FrameSource, LocalScheduler, Scheduler, Task, TaskId};
pub use value::{Callable, Opaque, Primitive, Record, RecordRef, SeqRef, Shape, Value, WeakValue};
