//! Sequential stage engine.
//!
//! A [`Pipeline`] runs each registered stage over one item in registration
//! order and stops at the first stage that does not let the item through.
//!
//! ```text
//!            ┌──────────┐ Proceed ┌──────────┐ Proceed       ┌──────────┐
//! Pending ──▶│ stage 0  │────────▶│ stage 1  │──── ... ─────▶│ Completed│
//!            └──────────┘         └──────────┘               └──────────┘
//!                 │ Skip               │ Fail / Err (retries exhausted)
//!                 ▼                    ▼
//!            Skipped (success)    Failed(stage 1)
//! ```
//!
//! Stages declared with [`StagePolicy::RetryWithBackoff`] race each attempt
//! against a timeout and wait `2^n * retry_base` after failed attempt `n`.
//! Throttle hints carried by a stage error do not change that schedule;
//! the rotator and queue act on them instead. An auth rejection ends the
//! stage on the attempt that saw it.

use std::{sync::Arc, time::Duration};

use feedrelay_core::{CallError, Clock, WorkItem};
use feedrelay_reliability::RetryPolicy;
use tracing::{debug, warn};

use crate::{
    error::{PipelineError, Result, StageError},
    stage::{StageContext, StageExecutor, StageOutcome, StagePolicy, StageReport, StageStatus},
};

/// Timing knobs shared by every retrying stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Backoff unit multiplied by `2^attempt`.
    pub retry_base: Duration,
    /// Upper bound for a single backoff wait.
    pub retry_max_delay: Duration,
    /// Jitter fraction applied to each backoff wait. Zero keeps waits exact.
    pub retry_jitter: f64,
    /// Attempts for the direct send stage.
    pub send_max_attempts: u32,
    /// Per-attempt timeout for the direct send stage.
    pub send_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            retry_jitter: 0.0,
            send_max_attempts: 5,
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Policy for stages that deliver directly downstream.
    pub const fn send_policy(&self) -> StagePolicy {
        StagePolicy::retry_with_backoff(self.send_max_attempts, self.send_timeout)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_base, self.retry_max_delay).with_jitter(self.retry_jitter)
    }
}

/// Outcome of running one item through the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// True when every stage passed or one skipped the item
    pub success: bool,
    /// True when a stage skipped the item
    pub skipped: bool,
    /// Final context, including metadata written by the stages that ran
    pub context: StageContext,
    /// Name of the stage that stopped the run with a failure
    pub failing_stage: Option<String>,
    /// Why that stage failed
    pub error: Option<StageError>,
}

impl PipelineResult {
    /// Per-stage reports in execution order.
    pub fn reports(&self) -> &[StageReport] {
        self.context.reports()
    }

    /// Attempts made by `stage`, if it ran.
    pub fn attempts(&self, stage: &str) -> Option<u32> {
        self.reports().iter().find(|report| report.stage == stage).map(|report| report.attempts)
    }

    /// True when the item went through every stage.
    pub const fn is_completed(&self) -> bool {
        self.success && !self.skipped
    }
}

struct RegisteredStage {
    name: String,
    policy: StagePolicy,
    executor: Arc<dyn StageExecutor>,
}

/// How a stage left the item after all of its attempts.
enum StageEnd {
    Proceed,
    Skip(String),
    Fail(StageError),
}

/// Ordered chain of named stages.
pub struct Pipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    stages: Vec<RegisteredStage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("stages", &self.stage_names())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new(config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, stages: Vec::new() }
    }

    /// Appends a stage. Stages run in registration order.
    pub fn register_stage(
        &mut self,
        name: impl Into<String>,
        policy: StagePolicy,
        executor: impl StageExecutor + 'static,
    ) -> Result<()> {
        self.register_shared(name, policy, Arc::new(executor))
    }

    /// Appends a stage whose executor is shared with other owners.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        policy: StagePolicy,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<()> {
        let name = name.into();
        if self.stages.iter().any(|stage| stage.name == name) {
            return Err(PipelineError::duplicate_stage(name));
        }
        if policy.max_attempts() == 0 {
            return Err(PipelineError::invalid_policy(name, "max_attempts must be at least 1"));
        }

        debug!(stage = %name, ?policy, position = self.stages.len(), "stage registered");
        self.stages.push(RegisteredStage { name, policy, executor });
        Ok(())
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    /// Number of registered stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when no stage is registered.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs `item` through every stage until one stops it.
    ///
    /// Never fails as a whole: a stage failure is reported in the result
    /// and affects only this item.
    pub async fn process(&self, item: WorkItem) -> PipelineResult {
        let mut ctx = StageContext::new(item);
        debug!(item_id = %ctx.item.id, scope = %ctx.item.scope, "pipeline pending");

        for stage in &self.stages {
            debug!(item_id = %ctx.item.id, stage = %stage.name, "stage running");
            let started = self.clock.now();
            let (end, attempts) = self.run_stage(stage, &mut ctx).await;
            let elapsed = self.clock.now().duration_since(started);

            let status = match &end {
                StageEnd::Proceed => StageStatus::Succeeded,
                StageEnd::Skip(_) => StageStatus::Skipped,
                StageEnd::Fail(_) => StageStatus::Failed,
            };
            ctx.push_report(StageReport { stage: stage.name.clone(), attempts, elapsed, status });

            match end {
                StageEnd::Proceed => {},
                StageEnd::Skip(reason) => {
                    debug!(
                        item_id = %ctx.item.id,
                        stage = %stage.name,
                        reason = %reason,
                        "pipeline skipped"
                    );
                    return PipelineResult {
                        success: true,
                        skipped: true,
                        context: ctx,
                        failing_stage: None,
                        error: None,
                    };
                },
                StageEnd::Fail(error) => {
                    warn!(
                        item_id = %ctx.item.id,
                        stage = %stage.name,
                        attempts,
                        error = %error,
                        "pipeline failed"
                    );
                    return PipelineResult {
                        success: false,
                        skipped: false,
                        context: ctx,
                        failing_stage: Some(stage.name.clone()),
                        error: Some(error),
                    };
                },
            }
        }

        debug!(item_id = %ctx.item.id, stages = self.stages.len(), "pipeline completed");
        PipelineResult {
            success: true,
            skipped: false,
            context: ctx,
            failing_stage: None,
            error: None,
        }
    }

    /// Runs one stage under its policy. Returns how it ended and the attempts made.
    async fn run_stage(&self, stage: &RegisteredStage, ctx: &mut StageContext) -> (StageEnd, u32) {
        match stage.policy {
            StagePolicy::NoRetry => (Self::settle(stage.executor.execute(ctx).await), 1),
            StagePolicy::RetryWithBackoff { max_attempts, timeout } => {
                let backoff = self.config.retry_policy();
                let mut attempt = 1;

                loop {
                    let result = tokio::time::timeout(timeout, stage.executor.execute(ctx))
                        .await
                        .unwrap_or_else(|_| Err(CallError::timeout(timeout)));

                    match result {
                        // Rejected credentials stay rejected.
                        Err(error) if error.is_auth() => {
                            return (StageEnd::Fail(StageError::Call(error)), attempt);
                        },
                        Err(error) if attempt < max_attempts => {
                            let wait = backoff.delay_after(attempt);
                            debug!(
                                item_id = %ctx.item.id,
                                stage = %stage.name,
                                attempt,
                                max_attempts,
                                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                                error = %error,
                                "stage attempt failed, backing off"
                            );
                            self.clock.sleep(wait).await;
                            attempt += 1;
                        },
                        other => return (Self::settle(other), attempt),
                    }
                }
            },
        }
    }

    fn settle(result: std::result::Result<StageOutcome, CallError>) -> StageEnd {
        match result {
            Ok(StageOutcome::Proceed) => StageEnd::Proceed,
            Ok(StageOutcome::Skip { reason }) => StageEnd::Skip(reason),
            Ok(StageOutcome::Fail { reason }) => StageEnd::Fail(StageError::rejected(reason)),
            Err(error) => StageEnd::Fail(StageError::Call(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use feedrelay_core::TestClock;

    use super::*;
    use crate::stage::stage_fn;

    fn pipeline() -> Pipeline {
        Pipeline::new(PipelineConfig::default(), Arc::new(TestClock::new()))
    }

    fn item() -> WorkItem {
        WorkItem::new("1", "rust", "chan", "text")
    }

    fn proceed() -> impl StageExecutor {
        stage_fn(|_: &mut StageContext| Ok(StageOutcome::Proceed))
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut pipeline = pipeline();
        pipeline.register_stage("dedup", StagePolicy::NoRetry, proceed()).unwrap();

        let error = pipeline.register_stage("dedup", StagePolicy::NoRetry, proceed()).unwrap_err();

        assert_eq!(error, PipelineError::duplicate_stage("dedup"));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn zero_attempt_policy_rejected() {
        let mut pipeline = pipeline();

        let error = pipeline
            .register_stage(
                "send",
                StagePolicy::retry_with_backoff(0, Duration::from_secs(1)),
                proceed(),
            )
            .unwrap_err();

        assert!(matches!(error, PipelineError::InvalidPolicy { .. }));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn stages_keep_registration_order() {
        let mut pipeline = pipeline();
        for name in ["validate", "dedup", "render"] {
            pipeline.register_stage(name, StagePolicy::NoRetry, proceed()).unwrap();
        }

        assert_eq!(pipeline.stage_names(), vec!["validate", "dedup", "render"]);
    }

    #[tokio::test]
    async fn empty_pipeline_completes() {
        let result = pipeline().process(item()).await;

        assert!(result.is_completed());
        assert!(result.reports().is_empty());
    }

    #[tokio::test]
    async fn fail_outcome_is_not_retried() {
        let mut pipeline = pipeline();
        pipeline
            .register_stage(
                "render",
                StagePolicy::retry_with_backoff(3, Duration::from_secs(1)),
                stage_fn(|_: &mut StageContext| Ok(StageOutcome::fail("template missing"))),
            )
            .unwrap();

        let result = pipeline.process(item()).await;

        assert!(!result.success);
        assert_eq!(result.failing_stage.as_deref(), Some("render"));
        assert_eq!(result.attempts("render"), Some(1));
        assert_eq!(result.error, Some(StageError::rejected("template missing")));
    }

    #[tokio::test]
    async fn no_retry_stage_error_stops_run() {
        let mut pipeline = pipeline();
        pipeline
            .register_stage(
                "dedup",
                StagePolicy::NoRetry,
                stage_fn(|_: &mut StageContext| Err(CallError::other("store offline"))),
            )
            .unwrap();
        pipeline
            .register_stage(
                "render",
                StagePolicy::NoRetry,
                stage_fn(|ctx: &mut StageContext| {
                    ctx.set("rendered", true);
                    Ok(StageOutcome::Proceed)
                }),
            )
            .unwrap();

        let result = pipeline.process(item()).await;

        assert!(!result.success);
        assert_eq!(result.failing_stage.as_deref(), Some("dedup"));
        assert_eq!(result.error, Some(StageError::Call(CallError::other("store offline"))));
        assert!(!result.context.contains("rendered"));
        assert_eq!(result.reports().len(), 1);
    }

    #[tokio::test]
    async fn auth_rejection_is_not_retried() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut pipeline = pipeline();
        pipeline
            .register_stage(
                "send",
                StagePolicy::retry_with_backoff(5, Duration::from_secs(1)),
                stage_fn(move |_: &mut StageContext| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(CallError::auth_failed("bot was kicked"))
                }),
            )
            .unwrap();

        let result = pipeline.process(item()).await;

        assert!(!result.success);
        assert_eq!(result.failing_stage.as_deref(), Some("send"));
        assert_eq!(result.attempts("send"), Some(1));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(result.error, Some(StageError::Call(ref e)) if e.is_auth()));
    }

    #[test]
    fn configured_jitter_reaches_backoff() {
        let exact = PipelineConfig::default().retry_policy();
        assert_eq!(exact.delay_after(3), Duration::from_secs(8));

        let config = PipelineConfig { retry_jitter: 0.5, ..PipelineConfig::default() };
        let policy = config.retry_policy();
        assert!((policy.jitter_factor - 0.5).abs() < f64::EPSILON);
        for _ in 0..50 {
            let delay = policy.delay_after(3);
            assert!(delay >= Duration::from_secs(4) && delay <= Duration::from_secs(12));
        }
    }
}
