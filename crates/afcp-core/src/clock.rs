//! Injectable monotonic time source.
//!
//! Every time-dependent component (registry heartbeats, admission windows,
//! the health monitor) reads time through [`Clock`] so that tests can drive
//! the control plane deterministically with [`ManualClock`] instead of
//! sleeping.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

/// A monotonic time source.
///
/// Implementations must be cheap to call and safe to share across threads;
/// the clock is shared read-only between all components.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current monotonic instant.
    fn now(&self) -> Instant;
}

/// Production clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock for deterministic tests.
///
/// The clock starts a comfortable distance after its internal epoch so tests
/// can construct instants in the past (for example a heartbeat 90 seconds
/// ago) without underflowing.
#[derive(Debug)]
pub struct ManualClock {
    epoch: Instant,
    offset: Mutex<Duration>,
}

/// Head start applied at construction so `now() - <recent past>` never
/// underflows in tests.
const MANUAL_CLOCK_HEAD_START: Duration = Duration::from_secs(3600);

impl ManualClock {
    /// Creates a manual clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Mutex::new(MANUAL_CLOCK_HEAD_START),
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch + *offset
    }
}
