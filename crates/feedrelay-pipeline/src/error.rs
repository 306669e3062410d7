//! Error types for pipeline assembly, stage execution and polling.

use feedrelay_core::{CallError, FailureKind};
use feedrelay_reliability::ReliabilityError;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failures raised while assembling a pipeline or running the poller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A stage with this name is already registered.
    #[error("stage '{name}' is already registered")]
    DuplicateStage {
        /// Stage name
        name: String,
    },

    /// The declared stage policy cannot run.
    #[error("invalid policy for stage '{name}': {reason}")]
    InvalidPolicy {
        /// Stage name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// The poller cannot continue without operator action.
    #[error("poller halted: {reason}")]
    PollerHalted {
        /// Why polling stopped
        reason: String,
    },

    /// A reliability component failed outside of a stage.
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),
}

impl PipelineError {
    /// Creates a duplicate stage error.
    pub fn duplicate_stage(name: impl Into<String>) -> Self {
        Self::DuplicateStage { name: name.into() }
    }

    /// Creates an invalid policy error.
    pub fn invalid_policy(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy { name: name.into(), reason: reason.into() }
    }

    /// Creates a poller halted error.
    pub fn poller_halted(reason: impl Into<String>) -> Self {
        Self::PollerHalted { reason: reason.into() }
    }

    /// True when the poller stopped for good.
    pub const fn is_halt(&self) -> bool {
        matches!(self, Self::PollerHalted { .. })
    }
}

/// Why a stage stopped an item's run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The stage looked at the item and refused it.
    #[error("rejected: {reason}")]
    Rejected {
        /// Reason given by the stage
        reason: String,
    },

    /// The stage's external call failed, after any retries.
    #[error(transparent)]
    Call(#[from] CallError),
}

impl StageError {
    /// Creates a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    /// The failed call, if the stage failed on one.
    pub const fn call_error(&self) -> Option<&CallError> {
        match self {
            Self::Call(error) => Some(error),
            Self::Rejected { .. } => None,
        }
    }

    /// Failure kind of the failed call, if any.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.call_error().map(FailureKind::from)
    }
}
