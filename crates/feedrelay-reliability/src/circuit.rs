//! Circuit breaker that fails fast on systemic faults but ignores throttling.
//!
//! One record is kept per protected call category (`upstream-fetch`,
//! `downstream-send`). The state is derived from the record and the clock
//! rather than stored, so a category reopens or half-opens purely by the
//! passage of time.
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!                      │           CLOSED            │
//!                      │  failure_count < threshold  │
//!                      └─────────────────────────────┘
//!                         │                       ▲
//!        threshold        │                       │  trial call
//!        systemic faults  │                       │  succeeds
//!        (throttles are   │                       │
//!         never counted)  ▼                       │
//!  ┌───────────────────────────┐      ┌──────────────────────────────┐
//!  │           OPEN            │      │          HALF-OPEN           │
//!  │  every call rejected      │ ───▶ │  one trial per test_interval │
//!  │  until reset_timeout      │      │  others rejected like OPEN   │
//!  └───────────────────────────┘      └──────────────────────────────┘
//!                 ▲                                  │
//!                 └──────────── trial fails ─────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feedrelay_core::{CallError, RealClock};
//! use feedrelay_reliability::{CircuitBreaker, CircuitConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new(CircuitConfig::default(), Arc::new(RealClock::new()));
//!
//! let page = breaker
//!     .execute("upstream-fetch", || async { Ok::<_, CallError>("page") })
//!     .await?;
//! # let _ = page;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use feedrelay_core::{CallError, CircuitSnapshot, CircuitState, CircuitStateStore, Clock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ReliabilityError, Result};

/// Circuit breaker configuration shared by all categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Systemic failures that open the circuit.
    pub threshold: u32,
    /// Time after the last failure before a trial call is admitted.
    pub reset_timeout: Duration,
    /// Minimum spacing between half-open trial calls.
    pub test_interval: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: Duration::from_secs(60),
            test_interval: Duration::from_secs(30),
        }
    }
}

/// Raw record for a single category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CircuitRecord {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_test_at: Option<Instant>,
    /// State last announced to the transition callback.
    reported: CircuitState,
}

impl CircuitRecord {
    const fn new() -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            last_test_at: None,
            reported: CircuitState::Closed,
        }
    }
}

/// Point-in-time view of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    /// Derived state.
    pub state: CircuitState,
    /// Systemic failures since the last success.
    pub failure_count: u32,
    /// Time since the most recent counted failure.
    pub since_last_failure: Option<Duration>,
    /// Time since the most recent half-open trial.
    pub since_last_test: Option<Duration>,
}

/// Callback fired on every state change.
pub type TransitionHook = Arc<dyn Fn(&CircuitSnapshot) + Send + Sync>;

/// Per-category circuit breaker.
///
/// Shared between callers through `Arc`. The internal lock is never held
/// while the wrapped operation runs.
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    circuits: Mutex<HashMap<String, CircuitRecord>>,
    on_transition: Option<TransitionHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("on_transition", &self.on_transition.is_some())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with every category closed.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, circuits: Mutex::new(HashMap::new()), on_transition: None }
    }

    /// Registers a callback fired with a snapshot on every state change.
    #[must_use]
    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    /// Configuration in effect.
    pub const fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Runs `op` if `category` is admitting calls and records the outcome.
    ///
    /// Returns [`ReliabilityError::CircuitOpen`] without invoking `op` when
    /// the category is open, or half-open with its trial already taken.
    /// Throttle failures are returned unchanged and never counted.
    pub async fn execute<T, F, Fut>(&self, category: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, CallError>>,
    {
        if !self.try_acquire(category).await {
            debug!(category, "call rejected by open circuit");
            return Err(ReliabilityError::circuit_open(category));
        }

        match op().await {
            Ok(value) => {
                self.record_success(category).await;
                Ok(value)
            },
            Err(error) => {
                self.record_failure(category, &error).await;
                Err(ReliabilityError::Call(error))
            },
        }
    }

    /// Admission check. Consumes the half-open trial slot when granted.
    #[allow(clippy::significant_drop_tightening)] // Check and trial stamp must be atomic
    pub async fn try_acquire(&self, category: &str) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = {
            let mut circuits = self.circuits.lock().await;
            let record = circuits.entry(category.to_string()).or_insert_with(CircuitRecord::new);

            let allowed = match self.derive_state(record, now) {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    let interval = self.config.test_interval;
                    let trial_due = record
                        .last_test_at
                        .is_none_or(|tested| now.duration_since(tested) >= interval);
                    if trial_due {
                        record.last_test_at = Some(now);
                    }
                    trial_due
                },
            };

            (allowed, self.note_transition(category, record, now))
        };

        self.announce(transition);
        allowed
    }

    /// Records a successful call: the category closes and its counters clear.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_success(&self, category: &str) {
        let now = self.clock.now();
        let transition = {
            let mut circuits = self.circuits.lock().await;
            let record = circuits.entry(category.to_string()).or_insert_with(CircuitRecord::new);

            record.failure_count = 0;
            record.last_failure_at = None;
            record.last_test_at = None;

            self.note_transition(category, record, now)
        };

        self.announce(transition);
    }

    /// Records a failed call. Throttle signals are ignored.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self, category: &str, error: &CallError) {
        if error.is_throttle() {
            debug!(category, error = %error, "throttle signal not counted against circuit");
            return;
        }

        let now = self.clock.now();
        let transition = {
            let mut circuits = self.circuits.lock().await;
            let record = circuits.entry(category.to_string()).or_insert_with(CircuitRecord::new);

            record.failure_count = record.failure_count.saturating_add(1);
            record.last_failure_at = Some(now);
            debug!(
                category,
                failure_count = record.failure_count,
                error = %error,
                "systemic failure recorded"
            );

            self.note_transition(category, record, now)
        };

        self.announce(transition);
    }

    /// Derived state of `category`. Unknown categories are closed.
    pub async fn state(&self, category: &str) -> CircuitState {
        let now = self.clock.now();
        let circuits = self.circuits.lock().await;
        circuits.get(category).map_or(CircuitState::Closed, |record| self.derive_state(record, now))
    }

    /// True while `category` rejects every call.
    pub async fn is_open(&self, category: &str) -> bool {
        self.state(category).await == CircuitState::Open
    }

    /// Counters and derived state for `category`.
    pub async fn stats(&self, category: &str) -> Option<CircuitStats> {
        let now = self.clock.now();
        let circuits = self.circuits.lock().await;
        circuits.get(category).map(|record| CircuitStats {
            state: self.derive_state(record, now),
            failure_count: record.failure_count,
            since_last_failure: record.last_failure_at.map(|at| now.duration_since(at)),
            since_last_test: record.last_test_at.map(|at| now.duration_since(at)),
        })
    }

    /// Clears the counters of `category` immediately.
    pub async fn force_reset(&self, category: &str) {
        let now = self.clock.now();
        let transition = {
            let mut circuits = self.circuits.lock().await;
            circuits.get_mut(category).and_then(|record| {
                record.failure_count = 0;
                record.last_failure_at = None;
                record.last_test_at = None;
                self.note_transition(category, record, now)
            })
        };

        info!(category, "circuit breaker force reset");
        self.announce(transition);
    }

    /// Clears the counters of every category immediately.
    pub async fn force_reset_all(&self) {
        let now = self.clock.now();
        let transitions: Vec<CircuitSnapshot> = {
            let mut circuits = self.circuits.lock().await;
            circuits
                .iter_mut()
                .filter_map(|(category, record)| {
                    record.failure_count = 0;
                    record.last_failure_at = None;
                    record.last_test_at = None;
                    self.note_transition(category, record, now)
                })
                .collect()
        };

        info!(categories = transitions.len(), "all circuit breakers force reset");
        for snapshot in transitions {
            self.announce(Some(snapshot));
        }
    }

    /// Portable snapshot of `category` with wall-clock timestamps.
    pub async fn snapshot(&self, category: &str) -> CircuitSnapshot {
        let now = self.clock.now();
        let circuits = self.circuits.lock().await;
        let record = circuits.get(category).copied().unwrap_or_else(CircuitRecord::new);
        self.build_snapshot(category, &record, now)
    }

    /// Replaces the record of `category` with a persisted snapshot.
    ///
    /// Does not fire the transition callback; the restored state is the
    /// one that was already announced before the restart.
    pub async fn restore(&self, snapshot: &CircuitSnapshot) {
        let now = self.clock.now();
        let mut record = CircuitRecord {
            failure_count: snapshot.failure_count,
            last_failure_at: snapshot.last_failure_at.map(|at| self.clock.instant_of(at)),
            last_test_at: snapshot.last_test_at.map(|at| self.clock.instant_of(at)),
            reported: CircuitState::Closed,
        };
        record.reported = self.derive_state(&record, now);

        info!(
            category = %snapshot.category,
            state = %record.reported,
            failure_count = record.failure_count,
            "circuit state restored"
        );
        self.circuits.lock().await.insert(snapshot.category.clone(), record);
    }

    /// Saves a snapshot of every known category to `store`.
    pub async fn persist_to(&self, store: &dyn CircuitStateStore) -> Result<()> {
        let now = self.clock.now();
        let snapshots: Vec<CircuitSnapshot> = {
            let circuits = self.circuits.lock().await;
            circuits
                .iter()
                .map(|(category, record)| self.build_snapshot(category, record, now))
                .collect()
        };

        for snapshot in &snapshots {
            store.save(&snapshot.category, snapshot).await?;
        }
        Ok(())
    }

    /// Loads and restores `categories` from `store`. Returns how many were found.
    pub async fn restore_from(
        &self,
        store: &dyn CircuitStateStore,
        categories: &[&str],
    ) -> Result<usize> {
        let mut restored = 0;
        for category in categories {
            if let Some(snapshot) = store.load(category).await? {
                self.restore(&snapshot).await;
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn derive_state(&self, record: &CircuitRecord, now: Instant) -> CircuitState {
        if record.failure_count < self.config.threshold {
            return CircuitState::Closed;
        }

        match record.last_failure_at {
            Some(failed_at) if now.duration_since(failed_at) < self.config.reset_timeout => {
                CircuitState::Open
            },
            _ => CircuitState::HalfOpen,
        }
    }

    fn build_snapshot(
        &self,
        category: &str,
        record: &CircuitRecord,
        now: Instant,
    ) -> CircuitSnapshot {
        CircuitSnapshot {
            category: category.to_string(),
            state: self.derive_state(record, now),
            failure_count: record.failure_count,
            last_failure_at: record.last_failure_at.map(|at| self.clock.wall_time_of(at)),
            last_test_at: record.last_test_at.map(|at| self.clock.wall_time_of(at)),
        }
    }

    /// Updates the reported state and returns a snapshot when it changed.
    fn note_transition(
        &self,
        category: &str,
        record: &mut CircuitRecord,
        now: Instant,
    ) -> Option<CircuitSnapshot> {
        let state = self.derive_state(record, now);
        if state == record.reported {
            return None;
        }

        let previous = record.reported;
        record.reported = state;

        let reset_timeout_ms =
            u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX);
        match state {
            CircuitState::Open => warn!(
                category,
                from = %previous,
                failure_count = record.failure_count,
                reset_timeout_ms,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                info!(category, from = %previous, "circuit breaker half-open, admitting trial");
            },
            CircuitState::Closed => info!(category, from = %previous, "circuit breaker closed"),
        }

        Some(self.build_snapshot(category, record, now))
    }

    fn announce(&self, transition: Option<CircuitSnapshot>) {
        if let (Some(hook), Some(snapshot)) = (&self.on_transition, transition) {
            hook(&snapshot);
        }
    }
}
