//! Poll cadence.

use std::fmt;
use std::str::FromStr;

use tickwatch_core::{Scheduler, Task, TaskId};
use tracing::warn;
use web_time::Duration;

use crate::error::IntervalParseError;

/// Shortest fixed interval a probe will poll at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// How often a probe re-checks its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollInterval {
    /// Once per display frame (or the scheduler's headless substitute).
    #[default]
    Frame,
    /// On a fixed timer.
    Every(Duration),
}

impl PollInterval {
    #[must_use]
    pub const fn millis(ms: u64) -> Self {
        Self::Every(Duration::from_millis(ms))
    }

    /// Raise fixed intervals below [`MIN_INTERVAL`] to the minimum.
    #[must_use]
    pub fn clamped(self) -> Self {
        match self {
            Self::Every(d) if d < MIN_INTERVAL => {
                warn!(
                    requested_ms = d.as_millis() as u64,
                    min_ms = MIN_INTERVAL.as_millis() as u64,
                    "poll interval below minimum; clamping"
                );
                Self::Every(MIN_INTERVAL)
            }
            other => other,
        }
    }

    /// Schedule `task` one tick from now on `scheduler`.
    pub fn schedule(self, scheduler: &dyn Scheduler, task: Task) -> TaskId {
        match self {
            Self::Frame => scheduler.request_frame(task),
            Self::Every(delay) => scheduler.set_timeout(delay, task),
        }
    }
}

impl FromStr for PollInterval {
    type Err = IntervalParseError;

    /// Accepts `frame` (any case, also `framerate`) or a millisecond count,
    /// optionally suffixed with `ms`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("frame") || trimmed.eq_ignore_ascii_case("framerate") {
            return Ok(Self::Frame);
        }
        let digits = trimmed.strip_suffix("ms").unwrap_or(trimmed).trim_end();
        digits
            .parse::<u64>()
            .map(Self::millis)
            .map_err(|_| IntervalParseError {
                input: s.to_string(),
            })
    }
}

impl fmt::Display for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame => f.write_str("frame"),
            Self::Every(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}
