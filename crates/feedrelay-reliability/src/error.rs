//! Error types for reliability components.

use feedrelay_core::{CallError, FailureKind};
use thiserror::Error;

/// Result type alias for reliability operations.
pub type Result<T> = std::result::Result<T, ReliabilityError>;

/// Failures raised by the breaker, the rotator, or the call they wrap.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReliabilityError {
    /// The category is not admitting calls. The wrapped operation never ran.
    #[error("circuit breaker open for {category}")]
    CircuitOpen {
        /// Protected call category
        category: String,
    },

    /// The rotator was constructed with an empty pool.
    #[error("no credentials configured")]
    NoCredentials,

    /// Every credential in the pool has been rejected by upstream.
    #[error("all {pool_size} credentials have been disabled")]
    CredentialsExhausted {
        /// Size of the pool
        pool_size: usize,
    },

    /// The wrapped call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

impl ReliabilityError {
    /// Creates a circuit open error.
    pub fn circuit_open(category: impl Into<String>) -> Self {
        Self::CircuitOpen { category: category.into() }
    }

    /// True when the breaker rejected the call without running it.
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The underlying call failure, if the call actually ran.
    pub const fn call_error(&self) -> Option<&CallError> {
        match self {
            Self::Call(error) => Some(error),
            _ => None,
        }
    }

    /// Failure kind of the underlying call, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.call_error().map(FailureKind::from)
    }
}
