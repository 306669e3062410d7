//! Clock abstraction for cooldowns, circuit windows and pacing.
//!
//! Every time-dependent decision in the relay (credential cooldowns, circuit
//! reset windows, queue pacing, stage backoff) reads time through [`Clock`]
//! so tests can drive it deterministically.
//!
//! [`RealClock`] reads tokio's clock rather than `std::time` directly. Under
//! `#[tokio::test(start_paused = true)]` its instants and sleeps follow the
//! paused runtime, which lets long backoff sequences run instantly while the
//! observed waits stay exact.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time for reliability components.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant for measuring windows.
    fn now(&self) -> Instant;

    /// Wall-clock time for records that leave the process.
    fn now_system(&self) -> SystemTime;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Converts a monotonic instant into a wall-clock timestamp.
    ///
    /// Instants in the future relative to `now()` map to the current time.
    fn wall_time_of(&self, instant: Instant) -> DateTime<Utc> {
        let age = self.now().saturating_duration_since(instant);
        let wall = self.now_system().checked_sub(age).unwrap_or(UNIX_EPOCH);
        DateTime::<Utc>::from(wall)
    }

    /// Converts a wall-clock timestamp back into a monotonic instant.
    ///
    /// Timestamps in the future, and timestamps older than the monotonic
    /// clock can represent, map to `now()`.
    fn instant_of(&self, timestamp: DateTime<Utc>) -> Instant {
        let now = self.now();
        let age = (self.now_utc() - timestamp).to_std().unwrap_or(Duration::ZERO);
        now.checked_sub(age).unwrap_or(now)
    }
}

/// Production clock backed by the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub const fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for state-machine tests.
///
/// Time only moves when [`TestClock::advance`] is called or when a caller
/// sleeps. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_system: SystemTime,
}

impl TestClock {
    /// Creates a clock anchored at the current wall time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a clock anchored at `start`.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_system: start,
        }
    }

    /// Moves time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.base_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Sleeping moves virtual time; yield so spawned tasks observe it.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
