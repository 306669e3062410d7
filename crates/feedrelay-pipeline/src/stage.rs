//! Stage building blocks: the executor trait, policies, outcomes and the
//! per-item context stages read and write.

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use feedrelay_core::{CallError, WorkItem};
use serde_json::Value;

/// Retry behaviour declared for a stage at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    /// Runs once. Used for checks that have no external call to retry.
    NoRetry,
    /// Each attempt races a timeout; failed attempts back off exponentially.
    RetryWithBackoff {
        /// Total attempts including the first
        max_attempts: u32,
        /// Upper bound for a single attempt
        timeout: Duration,
    },
}

impl StagePolicy {
    /// Shorthand for [`StagePolicy::RetryWithBackoff`].
    pub const fn retry_with_backoff(max_attempts: u32, timeout: Duration) -> Self {
        Self::RetryWithBackoff { max_attempts, timeout }
    }

    /// Total attempts this policy allows.
    pub const fn max_attempts(&self) -> u32 {
        match self {
            Self::NoRetry => 1,
            Self::RetryWithBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}

/// What a stage decided about the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Hand the item to the next stage.
    Proceed,
    /// Stop here; the run still counts as successful.
    Skip {
        /// Why the item was skipped
        reason: String,
    },
    /// Stop here and report this stage as failing. Never retried.
    Fail {
        /// Why the item was rejected
        reason: String,
    },
}

impl StageOutcome {
    /// Creates a skip outcome.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip { reason: reason.into() }
    }

    /// Creates a fail outcome.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail { reason: reason.into() }
    }
}

/// One named step of a pipeline.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs the stage against one item.
    ///
    /// `Err` is a failed external call and is eligible for retry under
    /// [`StagePolicy::RetryWithBackoff`].
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError>;
}

/// Adapter turning a synchronous closure into a [`StageExecutor`].
pub struct StageFn<F>(F);

impl<F> fmt::Debug for StageFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StageFn")
    }
}

/// Wraps `f` as a stage.
pub fn stage_fn<F>(f: F) -> StageFn<F>
where
    F: Fn(&mut StageContext) -> Result<StageOutcome, CallError> + Send + Sync,
{
    StageFn(f)
}

#[async_trait]
impl<F> StageExecutor for StageFn<F>
where
    F: Fn(&mut StageContext) -> Result<StageOutcome, CallError> + Send + Sync,
{
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        (self.0)(ctx)
    }
}

/// How a stage ended for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// The stage let the item through.
    Succeeded,
    /// The stage ended the run successfully without passing the item on.
    Skipped,
    /// The stage stopped the run with a failure.
    Failed,
}

/// Record of one stage's execution for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Stage name
    pub stage: String,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Time spent in the stage, including backoff waits
    pub elapsed: Duration,
    /// How the stage ended
    pub status: StageStatus,
}

impl StageReport {
    /// True unless the stage failed.
    pub const fn is_success(&self) -> bool {
        !matches!(self.status, StageStatus::Failed)
    }
}

/// Mutable state carried through one item's run.
///
/// Owned by a single run and never shared between items.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The item being processed
    pub item: WorkItem,
    metadata: BTreeMap<String, Value>,
    reports: Vec<StageReport>,
}

impl StageContext {
    /// Starts a context for `item` with empty metadata.
    pub const fn new(item: WorkItem) -> Self {
        Self { item, metadata: BTreeMap::new(), reports: Vec::new() }
    }

    /// Records a metadata entry, replacing any earlier value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Reads a metadata entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Reads a string metadata entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// True when a stage recorded `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    /// All metadata in key order.
    pub const fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Reports of the stages that ran, in order.
    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    pub(crate) fn push_report(&mut self, report: StageReport) {
        self.reports.push(report);
    }
}
