//! Reliability primitives for talking to flaky, rate-limited services.
//!
//! Three components share one rule: a throttle signal is expected
//! back-pressure, not a fault.
//!
//! - [`CircuitBreaker`] fails fast once a call category keeps failing
//!   systemically, and never counts throttles against it.
//! - [`CredentialRotator`] keeps one upstream credential current and moves
//!   away from throttled or unhealthy ones.
//! - [`DeliveryQueue`] drains outbound messages one at a time at a pace
//!   that follows the downstream channel's throttle feedback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use feedrelay_core::{Credential, RealClock};
//! use feedrelay_reliability::{CredentialRotator, RotatorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> feedrelay_reliability::Result<()> {
//! let rotator = Arc::new(CredentialRotator::new(
//!     vec![Credential::new("token-a"), Credential::new("token-b")],
//!     RotatorConfig::default(),
//!     Arc::new(RealClock::new()),
//! )?);
//!
//! let token = CancellationToken::new();
//! let reset_task = Arc::clone(&rotator).spawn_health_reset(token.clone());
//!
//! let credential = rotator.current().await;
//! # let _ = credential;
//! token.cancel();
//! # let _ = reset_task.await;
//! # Ok(())
//! # }
//! ```

pub mod circuit;
pub mod error;
pub mod queue;
pub mod retry;
pub mod rotator;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitStats, TransitionHook};
pub use error::{ReliabilityError, Result};
pub use feedrelay_core::CircuitState;
pub use queue::{DeadLetter, DeliveryQueue, DrainOutcome, QueueConfig, QueueStatus};
pub use retry::RetryPolicy;
pub use rotator::{CredentialHealth, CredentialRotator, CredentialStatus, RotatorConfig};
