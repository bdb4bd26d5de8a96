#![forbid(unsafe_code)]

//! Injected scheduling capability.
//!
//! Probes never talk to the host directly. They ask a [`Scheduler`] to run a
//! task "before the next frame" or "after a delay", and may cancel it by
//! handle. Which host primitive backs "next frame" is decided once, when the
//! scheduler is built, from a [`FrameSource`].
//!
//! [`LocalScheduler`] is the in-process implementation. It is pumped by the
//! host: call [`LocalScheduler::run_frame`] once per display refresh and
//! [`LocalScheduler::pump`] from the event loop. With a lab clock,
//! [`LocalScheduler::advance`] drives both deterministically.
//!
//! # Invariants
//!
//! 1. A task runs at most once. A cancelled task never runs.
//! 2. Tasks requested while a frame is running run on the following frame.
//! 3. Timers fire in due order; ties fire in scheduling order.
//! 4. No scheduler borrow is held while a task runs, so tasks may schedule or
//!    cancel freely.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::trace;
use web_time::{Duration, Instant};

use crate::clock::Clock;

/// Delay substituted for "next frame" when no display refresh exists.
pub const HEADLESS_FRAME: Duration = Duration::from_millis(16);

/// Environment variable overriding [`FrameSource::detect`].
pub const FRAME_SOURCE_ENV: &str = "TICKWATCH_FRAME_SOURCE";

/// A unit of scheduled work.
pub type Task = Box<dyn FnOnce()>;

/// Handle identifying a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Host capability: schedule once, cancel by handle.
pub trait Scheduler {
    /// Run `task` before the next display frame.
    fn request_frame(&self, task: Task) -> TaskId;

    /// Run `task` once `delay` has elapsed.
    fn set_timeout(&self, delay: Duration, task: Task) -> TaskId;

    /// Cancel a pending task. Returns `false` if it already ran or is unknown.
    fn cancel(&self, id: TaskId) -> bool;
}

/// Which primitive backs "next frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    /// The host calls [`LocalScheduler::run_frame`] once per display refresh.
    Display,
    /// No display: frame requests fall back to a [`HEADLESS_FRAME`] timer.
    Headless,
}

impl FrameSource {
    /// Detect the frame source for this process.
    ///
    /// `TICKWATCH_FRAME_SOURCE` (`display` / `headless`) wins; otherwise
    /// `wasm32` targets assume a display and everything else is headless.
    #[must_use]
    pub fn detect() -> Self {
        if let Ok(val) = std::env::var(FRAME_SOURCE_ENV)
            && let Some(source) = Self::parse(&val)
        {
            return source;
        }
        if cfg!(target_arch = "wasm32") {
            Self::Display
        } else {
            Self::Headless
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "display" | "frame" | "raf" => Some(Self::Display),
            "headless" | "timer" => Some(Self::Headless),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LocalScheduler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Queues {
    next_id: u64,
    frames: Vec<(TaskId, Task)>,
    timers: BTreeMap<(Instant, TaskId), Task>,
    due: HashMap<TaskId, Instant>,
}

impl Queues {
    fn next_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    fn next_due(&self) -> Option<Instant> {
        self.timers.keys().next().map(|(due, _)| *due)
    }

    /// Pop the earliest timer due at `now` that was scheduled before `barrier`.
    fn pop_due(&mut self, now: Instant, barrier: TaskId) -> Option<(TaskId, Task)> {
        let key = *self
            .timers
            .keys()
            .find(|(due, id)| *due <= now && *id <= barrier)?;
        let task = self.timers.remove(&key)?;
        self.due.remove(&key.1);
        Some((key.1, task))
    }
}

/// Host-pumped, single-threaded scheduler.
pub struct LocalScheduler {
    clock: Clock,
    source: FrameSource,
    queues: RefCell<Queues>,
}

impl fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.queues.borrow();
        f.debug_struct("LocalScheduler")
            .field("source", &self.source)
            .field("frames", &q.frames.len())
            .field("timers", &q.timers.len())
            .finish()
    }
}

impl LocalScheduler {
    #[must_use]
    pub fn new(source: FrameSource, clock: Clock) -> Self {
        Self {
            clock,
            source,
            queues: RefCell::new(Queues::default()),
        }
    }

    /// Real-time scheduler for the detected frame source.
    #[must_use]
    pub fn detect() -> Self {
        Self::new(FrameSource::detect(), Clock::Real)
    }

    #[must_use]
    pub fn frame_source(&self) -> FrameSource {
        self.source
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Number of tasks waiting (frames + timers).
    #[must_use]
    pub fn pending(&self) -> usize {
        let q = self.queues.borrow();
        q.frames.len() + q.timers.len()
    }

    /// Run every task queued for this frame. Returns how many ran.
    pub fn run_frame(&self) -> usize {
        let batch = std::mem::take(&mut self.queues.borrow_mut().frames);
        let count = batch.len();
        trace!(count, "scheduler.frame");
        for (_, task) in batch {
            task();
        }
        count
    }

    /// Run every timer that is due now. Timers scheduled while pumping wait
    /// for the next pump. Returns how many ran.
    pub fn pump(&self) -> usize {
        let now = self.clock.now();
        let barrier = TaskId(self.queues.borrow().next_id);
        let mut count = 0;
        loop {
            let next = self.queues.borrow_mut().pop_due(now, barrier);
            let Some((_, task)) = next else { break };
            task();
            count += 1;
        }
        if count > 0 {
            trace!(count, "scheduler.pump");
        }
        count
    }

    /// Advance a lab clock by `delta`, firing timers at their due times and,
    /// for a display source, one frame every [`HEADLESS_FRAME`].
    ///
    /// Does nothing but pump on a real clock. Returns how many tasks ran.
    pub fn advance(&self, delta: Duration) -> usize {
        let Some(lab) = self.clock.as_lab() else {
            return self.pump();
        };
        let target = lab.now() + delta;
        let mut next_frame = lab.now() + HEADLESS_FRAME;
        let mut count = 0;
        loop {
            let timer = self.queues.borrow().next_due().filter(|due| *due <= target);
            let frame = (self.source == FrameSource::Display && next_frame <= target)
                .then_some(next_frame);
            let step = match (timer, frame) {
                (Some(t), Some(f)) => t.min(f),
                (Some(t), None) => t,
                (None, Some(f)) => f,
                (None, None) => break,
            };
            lab.advance_to(step);
            if frame == Some(step) {
                count += self.run_frame();
                next_frame = step + HEADLESS_FRAME;
            }
            count += self.pump();
        }
        lab.advance_to(target);
        count
    }
}

impl Scheduler for LocalScheduler {
    fn request_frame(&self, task: Task) -> TaskId {
        match self.source {
            FrameSource::Display => {
                let mut q = self.queues.borrow_mut();
                let id = q.next_id();
                q.frames.push((id, task));
                id
            }
            FrameSource::Headless => self.set_timeout(HEADLESS_FRAME, task),
        }
    }

    fn set_timeout(&self, delay: Duration, task: Task) -> TaskId {
        let due = self.clock.now() + delay;
        let mut q = self.queues.borrow_mut();
        let id = q.next_id();
        q.timers.insert((due, id), task);
        q.due.insert(id, due);
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut q = self.queues.borrow_mut();
        if let Some(due) = q.due.remove(&id) {
            return q.timers.remove(&(due, id)).is_some();
        }
        let before = q.frames.len();
        q.frames.retain(|(task_id, _)| *task_id != id);
        q.frames.len() < before
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LabClock;
    use std::cell::Cell;
    use std::rc::Rc;

    fn lab(source: FrameSource) -> Rc<LocalScheduler> {
        Rc::new(LocalScheduler::new(source, Clock::Lab(LabClock::new())))
    }

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> Task) {
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        (hits, move || {
            let h = Rc::clone(&h);
            Box::new(move || h.set(h.get() + 1)) as Task
        })
    }

    #[test]
    fn timers_fire_when_due() {
        let sched = lab(FrameSource::Headless);
        let (hits, task) = counter();
        sched.set_timeout(Duration::from_millis(30), task());
        assert_eq!(sched.advance(Duration::from_millis(29)), 0);
        assert_eq!(sched.advance(Duration::from_millis(1)), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn headless_frames_fall_back_to_timer() {
        let sched = lab(FrameSource::Headless);
        let (hits, task) = counter();
        sched.request_frame(task());
        assert_eq!(sched.run_frame(), 0);
        sched.advance(HEADLESS_FRAME);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn display_frames_run_on_next_frame_only() {
        let sched = lab(FrameSource::Display);
        let hits = Rc::new(Cell::new(0));
        let s = Rc::clone(&sched);
        let h = Rc::clone(&hits);
        sched.request_frame(Box::new(move || {
            h.set(h.get() + 1);
            let h2 = Rc::clone(&h);
            s.request_frame(Box::new(move || h2.set(h2.get() + 1)));
        }));
        assert_eq!(sched.run_frame(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.run_frame(), 1);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let sched = lab(FrameSource::Display);
        let (hits, task) = counter();
        let timer = sched.set_timeout(Duration::from_millis(10), task());
        let frame = sched.request_frame(task());
        assert!(sched.cancel(timer));
        assert!(!sched.cancel(timer));
        assert!(sched.cancel(frame));
        assert!(!sched.cancel(frame));
        sched.run_frame();
        sched.advance(Duration::from_millis(50));
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn chained_timers_fire_at_each_period() {
        let sched = lab(FrameSource::Headless);
        let hits = Rc::new(Cell::new(0u32));

        fn arm(sched: Rc<LocalScheduler>, hits: Rc<Cell<u32>>) {
            let s = Rc::clone(&sched);
            sched.set_timeout(
                Duration::from_millis(10),
                Box::new(move || {
                    hits.set(hits.get() + 1);
                    arm(s, hits);
                }),
            );
        }

        arm(Rc::clone(&sched), Rc::clone(&hits));
        sched.advance(Duration::from_millis(55));
        assert_eq!(hits.get(), 5);
    }

    #[test]
    fn advance_runs_display_frames_periodically() {
        let sched = lab(FrameSource::Display);
        let (hits, task) = counter();
        sched.request_frame(task());
        sched.advance(HEADLESS_FRAME);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn frame_source_parses_aliases() {
        assert_eq!(FrameSource::parse("Display"), Some(FrameSource::Display));
        assert_eq!(FrameSource::parse(" timer "), Some(FrameSource::Headless));
        assert_eq!(FrameSource::parse("vsync?"), None);
    }
}
