//! Multi-credential rotation with health scoring.
//!
//! The rotator keeps exactly one credential current. Throttle signals put
//! the current credential into a cooldown and always move on to the best
//! remaining one; other failures only update health counters and leave the
//! decision to rotate with the caller.
//!
//! Cooldowns are staggered by pool position so that credentials throttled
//! at the same moment do not all come back at the same moment.

use std::{
    cmp::Ordering,
    sync::Arc,
    time::{Duration, Instant},
};

use feedrelay_core::{CallError, Clock, Credential};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ReliabilityError, Result};

/// Rotation thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotatorConfig {
    /// Minimum time a throttled credential sits out.
    pub cooldown: Duration,
    /// Extra cooldown per pool position.
    pub stagger: Duration,
    /// Consecutive failures that sideline a credential.
    pub max_consecutive_failures: u32,
    /// Errors within `health_window` that sideline a credential.
    pub error_threshold: u32,
    /// Age after which a credential's last error no longer counts.
    pub health_window: Duration,
    /// Period of the background health reset.
    pub health_reset_interval: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            stagger: Duration::from_secs(5),
            max_consecutive_failures: 3,
            error_threshold: 10,
            health_window: Duration::from_secs(600),
            health_reset_interval: Duration::from_secs(300),
        }
    }
}

/// Health counters for one credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialHealth {
    pub error_count: u32,
    pub consecutive_failures: u32,
    pub last_error_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub throttled_until: Option<Instant>,
    /// Rejected by upstream. Never cleared by the health reset.
    pub disabled: bool,
}

impl CredentialHealth {
    fn is_throttled(&self, now: Instant) -> bool {
        self.throttled_until.is_some_and(|until| until > now)
    }

    fn is_healthy(&self, config: &RotatorConfig, now: Instant) -> bool {
        if self.disabled || self.is_throttled(now) {
            return false;
        }
        if self.consecutive_failures >= config.max_consecutive_failures {
            return false;
        }

        let erroring_recently = self
            .last_error_at
            .is_some_and(|at| now.saturating_duration_since(at) < config.health_window);
        !(erroring_recently && self.error_count >= config.error_threshold)
    }
}

/// Operator view of one credential. Never includes the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    pub signature: String,
    pub label: Option<String>,
    pub is_current: bool,
    pub healthy: bool,
    pub disabled: bool,
    pub error_count: u32,
    pub consecutive_failures: u32,
    /// Remaining cooldown, if throttled.
    pub throttled_for: Option<Duration>,
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    signature: String,
    health: CredentialHealth,
}

#[derive(Debug)]
struct Pool {
    slots: Vec<Slot>,
    current: usize,
}

/// Owns the credential pool and selects the credential for the next call.
#[derive(Debug)]
pub struct CredentialRotator {
    config: RotatorConfig,
    clock: Arc<dyn Clock>,
    pool: Mutex<Pool>,
}

impl CredentialRotator {
    /// Builds a rotator over `credentials`, dropping duplicates by signature.
    ///
    /// The first credential becomes current.
    ///
    /// # Errors
    ///
    /// Returns [`ReliabilityError::NoCredentials`] when the pool is empty.
    pub fn new(
        credentials: Vec<Credential>,
        config: RotatorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut slots: Vec<Slot> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let signature = credential.signature();
            if slots.iter().any(|slot| slot.signature == signature) {
                warn!(credential = %signature, "duplicate credential ignored");
                continue;
            }
            slots.push(Slot { credential, signature, health: CredentialHealth::default() });
        }

        if slots.is_empty() {
            return Err(ReliabilityError::NoCredentials);
        }

        info!(pool_size = slots.len(), "credential rotator initialized");
        Ok(Self { config, clock, pool: Mutex::new(Pool { slots, current: 0 }) })
    }

    /// Number of distinct credentials in the pool.
    pub async fn len(&self) -> usize {
        self.pool.lock().await.slots.len()
    }

    /// The credential to use for the next call.
    pub async fn current(&self) -> Credential {
        let pool = self.pool.lock().await;
        pool.slots[pool.current].credential.clone()
    }

    /// Re-selects the current credential from the healthiest candidates.
    pub async fn rotate(&self) -> Credential {
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        self.rotate_locked(&mut pool, now);
        pool.slots[pool.current].credential.clone()
    }

    /// Records a failed call made with the current credential.
    ///
    /// A throttle puts the credential into cooldown and always rotates.
    /// Any other failure only updates counters; see [`Self::is_unhealthy`].
    /// Returns the credential that is current afterwards.
    pub async fn mark_error(&self, error: &CallError) -> Credential {
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let index = pool.current;
        let slot = &mut pool.slots[index];

        slot.health.error_count = slot.health.error_count.saturating_add(1);
        slot.health.consecutive_failures = slot.health.consecutive_failures.saturating_add(1);
        slot.health.last_error_at = Some(now);

        if error.is_throttle() {
            let wait = error
                .retry_after()
                .map_or(self.config.cooldown, |hint| hint.max(self.config.cooldown));
            let position = u32::try_from(index).unwrap_or(u32::MAX);
            let cooldown = wait.saturating_add(self.config.stagger.saturating_mul(position));
            slot.health.throttled_until = Some(now + cooldown);

            warn!(
                credential = %slot.signature,
                cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
                "credential throttled"
            );
            self.rotate_locked(&mut pool, now);
        } else {
            debug!(
                credential = %slot.signature,
                error_count = slot.health.error_count,
                consecutive_failures = slot.health.consecutive_failures,
                error = %error,
                "credential call failed"
            );
        }

        pool.slots[pool.current].credential.clone()
    }

    /// Records a successful call made with the current credential.
    pub async fn mark_success(&self) {
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let index = pool.current;
        let health = &mut pool.slots[index].health;
        health.consecutive_failures = 0;
        health.last_success_at = Some(now);
    }

    /// True when the current credential would not be picked by `rotate()`.
    pub async fn is_unhealthy(&self) -> bool {
        let now = self.clock.now();
        let pool = self.pool.lock().await;
        !pool.slots[pool.current].health.is_healthy(&self.config, now)
    }

    /// Removes the current credential from rotation after an auth rejection.
    ///
    /// # Errors
    ///
    /// Returns [`ReliabilityError::CredentialsExhausted`] when no enabled
    /// credential remains.
    pub async fn disable_current(&self) -> Result<Credential> {
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let index = pool.current;
        pool.slots[index].health.disabled = true;
        error!(
            credential = %pool.slots[index].signature,
            "credential rejected by upstream, removed from rotation"
        );

        if pool.slots.iter().all(|slot| slot.health.disabled) {
            warn!(pool_size = pool.slots.len(), "every credential has been disabled");
            return Err(ReliabilityError::CredentialsExhausted { pool_size: pool.slots.len() });
        }

        self.rotate_locked(&mut pool, now);
        Ok(pool.slots[pool.current].credential.clone())
    }

    /// Clears health records whose last error is older than the window.
    ///
    /// Returns the number of records cleared.
    pub async fn reset_stale_health(&self) -> usize {
        let now = self.clock.now();
        let mut pool = self.pool.lock().await;
        let mut cleared = 0;

        for slot in &mut pool.slots {
            let stale = slot
                .health
                .last_error_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.config.health_window);
            if stale {
                let disabled = slot.health.disabled;
                slot.health = CredentialHealth { disabled, ..CredentialHealth::default() };
                cleared += 1;
                debug!(credential = %slot.signature, "stale credential health cleared");
            }
        }

        if cleared > 0 {
            info!(cleared, "credential health reset");
        }
        cleared
    }

    /// Spawns the periodic health reset. Stops when `token` is cancelled.
    pub fn spawn_health_reset(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.health_reset_interval;
            info!(
                interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
                "health reset task starting"
            );

            loop {
                tokio::select! {
                    () = self.clock.sleep(interval) => {
                        self.reset_stale_health().await;
                    }
                    () = token.cancelled() => break,
                }
            }

            info!("health reset task stopped");
        })
    }

    /// Operator view of the pool, in pool order.
    pub async fn statuses(&self) -> Vec<CredentialStatus> {
        let now = self.clock.now();
        let pool = self.pool.lock().await;
        pool.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| CredentialStatus {
                signature: slot.signature.clone(),
                label: slot.credential.label.clone(),
                is_current: index == pool.current,
                healthy: slot.health.is_healthy(&self.config, now),
                disabled: slot.health.disabled,
                error_count: slot.health.error_count,
                consecutive_failures: slot.health.consecutive_failures,
                throttled_for: slot
                    .health
                    .throttled_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
            })
            .collect()
    }

    /// Raw health record of the credential at `index`.
    pub async fn health(&self, index: usize) -> Option<CredentialHealth> {
        self.pool.lock().await.slots.get(index).map(|slot| slot.health)
    }

    fn rotate_locked(&self, pool: &mut Pool, now: Instant) {
        if pool.slots.len() == 1 {
            return;
        }

        let previous = pool.current;
        let healthy = best_candidate(&pool.slots, |health| health.is_healthy(&self.config, now));

        let next = healthy.or_else(|| {
            let current = &pool.slots[previous].health;
            if !current.disabled && !current.is_throttled(now) {
                return None;
            }
            // Current is unusable: prefer any enabled credential that is not
            // cooling down, then the one whose cooldown ends first.
            best_candidate(&pool.slots, |health| !health.disabled && !health.is_throttled(now))
                .or_else(|| {
                    current.disabled.then(|| earliest_available(&pool.slots)).flatten()
                })
        });

        match next {
            Some(index) if index != previous => {
                pool.current = index;
                info!(
                    from = %pool.slots[previous].signature,
                    to = %pool.slots[index].signature,
                    "rotated credential"
                );
            },
            Some(_) => {},
            None => {
                if healthy.is_none() {
                    warn!(
                        credential = %pool.slots[previous].signature,
                        pool_size = pool.slots.len(),
                        "no healthy credential available, keeping current"
                    );
                }
            },
        }
    }
}

/// Lowest error count, then most recent success, then pool order.
fn best_candidate(slots: &[Slot], eligible: impl Fn(&CredentialHealth) -> bool) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| eligible(&slot.health))
        .min_by(|(a_index, a), (b_index, b)| {
            compare_health(&a.health, &b.health).then(a_index.cmp(b_index))
        })
        .map(|(index, _)| index)
}

fn compare_health(a: &CredentialHealth, b: &CredentialHealth) -> Ordering {
    a.error_count.cmp(&b.error_count).then_with(|| b.last_success_at.cmp(&a.last_success_at))
}

fn earliest_available(slots: &[Slot]) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| !slot.health.disabled)
        .min_by_key(|(index, slot)| (slot.health.throttled_until, *index))
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use feedrelay_core::TestClock;

    use super::*;

    fn config() -> RotatorConfig {
        RotatorConfig {
            cooldown: Duration::from_secs(60),
            stagger: Duration::from_secs(5),
            max_consecutive_failures: 3,
            error_threshold: 5,
            health_window: Duration::from_secs(600),
            health_reset_interval: Duration::from_secs(300),
        }
    }

    fn pool(size: usize) -> Vec<Credential> {
        (0..size)
            .map(|i| Credential::new(format!("token-{i}")).with_label(format!("cred-{i}")))
            .collect()
    }

    fn rotator(size: usize) -> (CredentialRotator, TestClock) {
        let clock = TestClock::new();
        let rotator =
            CredentialRotator::new(pool(size), config(), Arc::new(clock.clone())).unwrap();
        (rotator, clock)
    }

    #[test]
    fn empty_pool_rejected() {
        let result = CredentialRotator::new(Vec::new(), config(), Arc::new(TestClock::new()));
        assert!(matches!(result, Err(ReliabilityError::NoCredentials)));
    }

    #[tokio::test]
    async fn duplicates_removed_by_signature() {
        let credentials = vec![
            Credential::new("same"),
            Credential::new("same").with_label("copy"),
            Credential::new("other"),
        ];
        let rotator =
            CredentialRotator::new(credentials, config(), Arc::new(TestClock::new())).unwrap();

        assert_eq!(rotator.len().await, 2);
    }

    #[tokio::test]
    async fn throttle_sets_staggered_cooldown() {
        let (rotator, clock) = rotator(3);
        let start = clock.now();

        rotator.mark_error(&CallError::throttled(None)).await;
        let health = rotator.health(0).await.unwrap();
        assert_eq!(health.throttled_until, Some(start + Duration::from_secs(60)));

        rotator.mark_error(&CallError::throttled(None)).await;
        let health = rotator.health(1).await.unwrap();
        assert_eq!(health.throttled_until, Some(start + Duration::from_secs(65)));
    }

    #[tokio::test]
    async fn longer_retry_hint_extends_cooldown() {
        let (rotator, clock) = rotator(2);
        let start = clock.now();

        rotator.mark_error(&CallError::throttled(Some(Duration::from_secs(900)))).await;

        let health = rotator.health(0).await.unwrap();
        assert_eq!(health.throttled_until, Some(start + Duration::from_secs(900)));
    }

    #[tokio::test]
    async fn rotation_walks_pool_under_throttling() {
        let (rotator, _clock) = rotator(3);

        let next = rotator.mark_error(&CallError::throttled(None)).await;
        assert_eq!(next.label.as_deref(), Some("cred-1"));

        let next = rotator.mark_error(&CallError::throttled(None)).await;
        assert_eq!(next.label.as_deref(), Some("cred-2"));

        let next = rotator.mark_error(&CallError::throttled(None)).await;
        assert_eq!(next.label.as_deref(), Some("cred-2"));
        assert_eq!(rotator.rotate().await.label.as_deref(), Some("cred-2"));
    }

    #[tokio::test]
    async fn single_credential_rotation_is_noop() {
        let (rotator, _clock) = rotator(1);
        let only = rotator.current().await;

        rotator.mark_error(&CallError::throttled(None)).await;

        assert_eq!(rotator.rotate().await, only);
        assert_eq!(rotator.rotate().await, only);
    }

    #[tokio::test]
    async fn non_throttle_errors_do_not_rotate() {
        let (rotator, _clock) = rotator(2);

        let after = rotator.mark_error(&CallError::other("500")).await;

        assert_eq!(after.label.as_deref(), Some("cred-0"));
        assert!(!rotator.is_unhealthy().await);
    }

    #[tokio::test]
    async fn consecutive_failures_make_credential_unhealthy() {
        let (rotator, _clock) = rotator(2);
        for _ in 0..3 {
            rotator.mark_error(&CallError::other("500")).await;
        }

        assert!(rotator.is_unhealthy().await);
        assert_eq!(rotator.rotate().await.label.as_deref(), Some("cred-1"));
    }

    #[tokio::test]
    async fn success_clears_consecutive_failures() {
        let (rotator, _clock) = rotator(2);
        rotator.mark_error(&CallError::other("500")).await;
        rotator.mark_error(&CallError::other("500")).await;

        rotator.mark_success().await;

        let health = rotator.health(0).await.unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.error_count, 2);
        assert!(health.last_success_at.is_some());
    }

    #[test]
    fn ties_broken_by_recent_success() {
        let now = Instant::now();
        let slot = |secret: &str, error_count: u32, last_success_at: Option<Instant>| Slot {
            credential: Credential::new(secret),
            signature: secret.to_string(),
            health: CredentialHealth {
                error_count,
                last_success_at,
                ..CredentialHealth::default()
            },
        };
        let slots = vec![
            slot("a", 2, None),
            slot("b", 1, Some(now)),
            slot("c", 1, Some(now + Duration::from_secs(5))),
            slot("d", 1, None),
        ];

        assert_eq!(best_candidate(&slots, |_| true), Some(2));
        assert_eq!(best_candidate(&slots[..2], |_| true), Some(1));
        assert_eq!(best_candidate(&slots, |health| health.last_success_at.is_none()), Some(3));
    }

    #[tokio::test]
    async fn cooldown_expiry_returns_credential_to_rotation() {
        let (rotator, clock) = rotator(2);
        rotator.mark_error(&CallError::throttled(None)).await;
        rotator.mark_error(&CallError::throttled(None)).await;

        clock.advance(Duration::from_secs(61));

        assert_eq!(rotator.rotate().await.label.as_deref(), Some("cred-0"));
    }

    #[tokio::test]
    async fn stale_health_cleared_but_disable_kept() {
        let (rotator, clock) = rotator(2);
        for _ in 0..3 {
            rotator.mark_error(&CallError::other("500")).await;
        }
        rotator.disable_current().await.unwrap();

        clock.advance(Duration::from_secs(601));
        assert_eq!(rotator.reset_stale_health().await, 1);

        let health = rotator.health(0).await.unwrap();
        assert_eq!(health.error_count, 0);
        assert!(health.disabled);
    }

    #[tokio::test]
    async fn disabling_every_credential_is_an_error() {
        let (rotator, _clock) = rotator(2);

        let next = rotator.disable_current().await.unwrap();
        assert_eq!(next.label.as_deref(), Some("cred-1"));

        let result = rotator.disable_current().await;
        assert_eq!(result, Err(ReliabilityError::CredentialsExhausted { pool_size: 2 }));
    }

    #[tokio::test]
    async fn statuses_never_expose_secret() {
        let (rotator, _clock) = rotator(2);

        let rendered = format!("{:?}", rotator.statuses().await);

        assert!(!rendered.contains("token-0"));
        assert!(rendered.contains("cred-0"));
    }
}
