#![forbid(unsafe_code)]

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("invalid configuration: {0}")]
    Configuration(&'static str),
}

/// Time source for animations and `now()`.
///
/// Everything runs on the single rendering thread, so implementations only need shared
/// references and are held as `Rc<dyn Clock>`.
pub trait Clock: std::fmt::Debug {
    /// Milliseconds since the UNIX epoch.
    fn now_ms(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        now_unix_ms().unwrap_or_default() as f64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: f64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: f64) {
        self.now.set(now_ms);
    }

    pub fn advance(&self, delta_ms: f64) {
        self.now.set(self.now.get() + delta_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.now.get()
    }
}

pub fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

/// Tunables for the expression engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resolution of the streaming histogram behind viewport percentiles.
    pub histogram_buckets: usize,
    /// Blend duration used when a caller does not pick one.
    pub default_blend_ms: f64,
    /// Marker that selects the grid property-access path in a fragment shader template.
    pub grid_marker: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: 1000,
            default_blend_ms: 400.0,
            grid_marker: "GRID!!!".to_owned(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_histogram_buckets(mut self, buckets: usize) -> Self {
        self.histogram_buckets = buckets;
        self
    }

    #[must_use]
    pub fn with_default_blend_ms(mut self, ms: f64) -> Self {
        self.default_blend_ms = ms;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.histogram_buckets == 0 {
            return Err(RuntimeError::Configuration(
                "histogram_buckets must be greater than zero",
            ));
        }
        if !(self.default_blend_ms.is_finite() && self.default_blend_ms >= 0.0) {
            return Err(RuntimeError::Configuration(
                "default_blend_ms must be a non-negative finite number",
            ));
        }
        if self.grid_marker.is_empty() {
            return Err(RuntimeError::Configuration("grid_marker must not be empty"));
        }
        Ok(())
    }
}
