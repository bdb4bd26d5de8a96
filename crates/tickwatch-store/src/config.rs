//! Store configuration.
//!
//! Defaults poll once per frame with per-key probes started immediately.
//! [`StoreConfig::from_env`] overlays environment variables on the defaults:
//!
//! | Variable              | Values                         |
//! |-----------------------|--------------------------------|
//! | `TICKWATCH_INTERVAL`  | `frame` or a millisecond count |
//! | `TICKWATCH_AUTO_START`| `1`/`true`/`yes`, `0`/`false`/`no` |
//! | `TICKWATCH_DEBUG`     | same as above                  |
//!
//! Unparseable values are logged and ignored.

use std::env;

use tickwatch_core::CodecConfig;
use tickwatch_probe::PollInterval;
use tracing::warn;

pub const INTERVAL_ENV: &str = "TICKWATCH_INTERVAL";
pub const AUTO_START_ENV: &str = "TICKWATCH_AUTO_START";
pub const DEBUG_ENV: &str = "TICKWATCH_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Cadence for committers and per-key probes.
    pub interval: PollInterval,
    /// Whether new per-key probes start polling immediately.
    pub auto_start: bool,
    /// Debug tracing on every probe the store creates.
    pub debug: bool,
    pub codec: CodecConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            interval: PollInterval::Frame,
            auto_start: true,
            debug: false,
            codec: CodecConfig::default(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn interval(mut self, interval: PollInterval) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Defaults overlaid with `TICKWATCH_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(val) = lookup(INTERVAL_ENV) {
            match val.parse::<PollInterval>() {
                Ok(interval) => config.interval = interval,
                Err(err) => warn!(var = INTERVAL_ENV, %err, "ignoring invalid setting"),
            }
        }
        if let Some(val) = lookup(AUTO_START_ENV)
            && let Some(flag) = parse_flag(AUTO_START_ENV, &val)
        {
            config.auto_start = flag;
        }
        if let Some(val) = lookup(DEBUG_ENV)
            && let Some(flag) = parse_flag(DEBUG_ENV, &val)
        {
            config.debug = flag;
        }
        config
    }
}

fn parse_flag(var: &str, val: &str) -> Option<bool> {
    let val = val.trim();
    if val == "1" || val.eq_ignore_ascii_case("true") || val.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if val == "0" || val.eq_ignore_ascii_case("false") || val.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        warn!(var, value = val, "ignoring invalid flag");
        None
    }
}
