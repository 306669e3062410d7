//! Normalized failure taxonomy for every external call.
//!
//! Upstream fetches, seen-store lookups and downstream sends all report
//! failures as a [`CallError`]. The collaborator that talks to the outside
//! world is responsible for mapping its raw errors (HTTP status codes,
//! driver errors) into one of these variants. The reliability layer only
//! ever inspects the variant, never the message text.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The callee asked us to slow down (HTTP 429 or equivalent).
    #[error("throttled by remote{}", retry_hint(*.retry_after))]
    Throttled {
        /// Explicit wait requested by the callee, when it supplied one.
        retry_after: Option<Duration>,
    },

    /// The credential or channel was rejected outright.
    #[error("authentication rejected: {message}")]
    AuthFailed {
        /// Description of the rejection
        message: String,
    },

    /// The call did not settle before its deadline.
    #[error("call timed out after {}ms", .after.as_millis())]
    Timeout {
        /// Deadline that was exceeded
        after: Duration,
    },

    /// Any other failure. Counted as systemic.
    #[error("call failed: {message}")]
    Other {
        /// Description of the failure
        message: String,
    },
}

fn retry_hint(retry_after: Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(", retry after {}ms", d.as_millis()))
}

impl CallError {
    /// Creates a throttle error with an optional retry hint.
    pub const fn throttled(retry_after: Option<Duration>) -> Self {
        Self::Throttled { retry_after }
    }

    /// Creates an authentication failure.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed { message: message.into() }
    }

    /// Creates a timeout failure.
    pub const fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Creates a generic systemic failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other { message: message.into() }
    }

    /// True when the callee asked us to back off.
    ///
    /// Throttle signals drive credential rotation and queue pacing but are
    /// never counted against a circuit breaker.
    pub const fn is_throttle(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// True for authentication failures, which retries cannot fix.
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed { .. })
    }

    /// Retry hint carried by a throttle signal.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Coarse classification of a [`CallError`] for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Rate limiting.
    Throttle,
    /// Rejected credentials.
    Auth,
    /// Deadline exceeded.
    Timeout,
    /// Everything else.
    Systemic,
}

impl From<&CallError> for FailureKind {
    fn from(error: &CallError) -> Self {
        match error {
            CallError::Throttled { .. } => Self::Throttle,
            CallError::AuthFailed { .. } => Self::Auth,
            CallError::Timeout { .. } => Self::Timeout,
            CallError::Other { .. } => Self::Systemic,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttle => write!(f, "throttle"),
            Self::Auth => write!(f, "auth"),
            Self::Timeout => write!(f, "timeout"),
            Self::Systemic => write!(f, "systemic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_signals_identified() {
        assert!(CallError::throttled(None).is_throttle());
        assert!(CallError::throttled(Some(Duration::from_secs(30))).is_throttle());

        assert!(!CallError::auth_failed("bad token").is_throttle());
        assert!(!CallError::timeout(Duration::from_secs(5)).is_throttle());
        assert!(!CallError::other("connection reset").is_throttle());
    }

    #[test]
    fn retry_after_only_on_throttle() {
        let throttled = CallError::throttled(Some(Duration::from_millis(5000)));
        assert_eq!(throttled.retry_after(), Some(Duration::from_millis(5000)));

        assert_eq!(CallError::throttled(None).retry_after(), None);
        assert_eq!(CallError::other("boom").retry_after(), None);
    }

    #[test]
    fn failure_kinds_mapped() {
        assert_eq!(FailureKind::from(&CallError::throttled(None)), FailureKind::Throttle);
        assert_eq!(FailureKind::from(&CallError::auth_failed("x")), FailureKind::Auth);
        assert_eq!(
            FailureKind::from(&CallError::timeout(Duration::from_secs(1))),
            FailureKind::Timeout
        );
        assert_eq!(FailureKind::from(&CallError::other("x")), FailureKind::Systemic);
        assert_eq!(FailureKind::Systemic.to_string(), "systemic");
    }

    #[test]
    fn error_display_format() {
        assert_eq!(CallError::throttled(None).to_string(), "throttled by remote");
        assert_eq!(
            CallError::throttled(Some(Duration::from_secs(2))).to_string(),
            "throttled by remote, retry after 2000ms"
        );
        assert_eq!(
            CallError::timeout(Duration::from_millis(1500)).to_string(),
            "call timed out after 1500ms"
        );
    }
}
