//! Wall-clock abstraction.
//!
//! Target names are derived from wall-clock time, so rotation is only
//! testable if time can be controlled. Production code reads the system
//! clock; tests and simulations use `SimulatedClock`, which only moves when
//! told to.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WallTimestamp(pub i64);

impl WallTimestamp {
    pub const EPOCH: WallTimestamp = WallTimestamp(0);

    pub fn from_millis(ms: i64) -> Self {
        WallTimestamp(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// UTC calendar time. Out-of-range values clamp to the epoch.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

impl std::ops::Add<Duration> for WallTimestamp {
    type Output = WallTimestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        let ms = i64::try_from(rhs.as_millis()).unwrap_or(i64::MAX);
        WallTimestamp(self.0.saturating_add(ms))
    }
}

/// Clock trait for wall-clock reads
///
/// Implementations:
/// - `SystemClock`: real system time
/// - `SimulatedClock`: controlled virtual time
pub trait Clock: Send + Sync + Clone + 'static {
    fn now(&self) -> WallTimestamp;
}

/// Production clock using the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> WallTimestamp {
        WallTimestamp(Utc::now().timestamp_millis())
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicI64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: i64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Start at a UTC calendar time.
    pub fn at(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime.timestamp_millis())
    }

    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: i64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn set_datetime(&self, datetime: DateTime<Utc>) {
        self.set(datetime.timestamp_millis());
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> WallTimestamp {
        WallTimestamp(self.time_ms.load(Ordering::SeqCst))
    }
}
