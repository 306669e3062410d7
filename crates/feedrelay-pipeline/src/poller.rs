//! Periodic upstream polling feeding the pipeline.
//!
//! Each cycle walks the configured topics in order. A fetch runs under the
//! `upstream-fetch` circuit with the rotator's current credential, and the
//! outcome steers the rotator:
//!
//! | Fetch outcome | Rotator action                                    |
//! |---------------|---------------------------------------------------|
//! | success       | `mark_success`                                    |
//! | throttled     | `mark_error` (cooldown and rotate)                |
//! | auth rejected | `disable_current`; halt when none remain          |
//! | other failure | `mark_error`; rotate once the credential is unhealthy |
//! | circuit open  | none; the rest of the cycle is skipped            |
//!
//! Items are processed one at a time with a pause between items and a
//! longer pause between topics, so bursts never reach upstream.

use std::{collections::HashMap, sync::Arc, time::Duration};

use feedrelay_core::{
    CallError, Clock, FailureKind, FetchQuery, Scope, Topic, UpstreamSource, UPSTREAM_FETCH,
};
use feedrelay_reliability::{CircuitBreaker, CredentialRotator, ReliabilityError};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::Pipeline,
    error::{PipelineError, Result},
};

/// Poller timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Time between the end of one cycle and the start of the next.
    pub interval: Duration,
    /// Pause between consecutive items of one page.
    pub item_pacing: Duration,
    /// Pause between consecutive topics of one cycle.
    pub topic_pacing: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            item_pacing: Duration::from_secs(1),
            topic_pacing: Duration::from_secs(2),
        }
    }
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Topics a fetch was attempted for
    pub topics_polled: usize,
    /// Fetches that failed
    pub fetch_failures: usize,
    /// Items returned by upstream
    pub items_fetched: usize,
    /// Items that went through every stage
    pub items_accepted: usize,
    /// Items a stage skipped
    pub items_skipped: usize,
    /// Items a stage failed
    pub items_failed: usize,
    /// True when the upstream circuit cut the cycle short
    pub circuit_open: bool,
}

enum TopicEnd {
    Done,
    CircuitOpen,
    Cancelled,
}

/// Drives upstream fetches into the pipeline.
pub struct Poller {
    config: PollerConfig,
    topics: Vec<Topic>,
    source: Arc<dyn UpstreamSource>,
    rotator: Arc<CredentialRotator>,
    breaker: Arc<CircuitBreaker>,
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
    cursors: Mutex<HashMap<Scope, String>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("topics", &self.topics.len())
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Creates a poller over `topics`.
    pub fn new(
        config: PollerConfig,
        topics: Vec<Topic>,
        source: Arc<dyn UpstreamSource>,
        rotator: Arc<CredentialRotator>,
        breaker: Arc<CircuitBreaker>,
        pipeline: Arc<Pipeline>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            topics,
            source,
            rotator,
            breaker,
            pipeline,
            clock,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Cursor that the next fetch for `scope` will resume from.
    pub async fn cursor(&self, scope: &Scope) -> Option<String> {
        self.cursors.lock().await.get(scope).cloned()
    }

    /// Runs a single cycle over every topic.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::PollerHalted`] when upstream has rejected
    /// every credential.
    pub async fn poll_once(&self) -> Result<PollReport> {
        self.poll_cycle(&CancellationToken::new()).await
    }

    /// Polls until `token` is cancelled or the poller halts.
    ///
    /// Cancellation is observed between items and during pauses; an item
    /// already in the pipeline finishes first.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            topics = self.topics.len(),
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            "poller starting"
        );

        while !token.is_cancelled() {
            match self.poll_cycle(&token).await {
                Ok(report) => info!(
                    topics_polled = report.topics_polled,
                    fetch_failures = report.fetch_failures,
                    fetched = report.items_fetched,
                    accepted = report.items_accepted,
                    skipped = report.items_skipped,
                    failed = report.items_failed,
                    circuit_open = report.circuit_open,
                    "poll cycle finished"
                ),
                Err(halt) => {
                    error!(error = %halt, "poller halted");
                    return Err(halt);
                },
            }

            if !self.pause(self.config.interval, &token).await {
                break;
            }
        }

        info!("poller stopped");
        Ok(())
    }

    /// Spawns [`Self::run`] as a background task.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(token).await })
    }

    async fn poll_cycle(&self, token: &CancellationToken) -> Result<PollReport> {
        let mut report = PollReport::default();

        for (index, topic) in self.topics.iter().enumerate() {
            if index > 0 && !self.pause(self.config.topic_pacing, token).await {
                break;
            }

            match self.poll_topic(topic, token, &mut report).await? {
                TopicEnd::Done => {},
                TopicEnd::CircuitOpen => {
                    info!(scope = %topic.scope, "upstream circuit open, skipping rest of cycle");
                    report.circuit_open = true;
                    break;
                },
                TopicEnd::Cancelled => break,
            }
        }

        Ok(report)
    }

    async fn poll_topic(
        &self,
        topic: &Topic,
        token: &CancellationToken,
        report: &mut PollReport,
    ) -> Result<TopicEnd> {
        if token.is_cancelled() {
            return Ok(TopicEnd::Cancelled);
        }

        let credential = self.rotator.current().await;
        let query = FetchQuery {
            scope: topic.scope.clone(),
            query: topic.query.clone(),
            cursor: self.cursor(&topic.scope).await,
        };

        let fetched =
            self.breaker.execute(UPSTREAM_FETCH, || self.source.fetch(&query, &credential)).await;
        let page = match fetched {
            Ok(page) => page,
            Err(error) if error.is_circuit_open() => return Ok(TopicEnd::CircuitOpen),
            Err(error) => {
                report.topics_polled += 1;
                report.fetch_failures += 1;
                self.on_fetch_failed(topic, error).await?;
                return Ok(TopicEnd::Done);
            },
        };

        report.topics_polled += 1;
        self.rotator.mark_success().await;
        if let Some(cursor) = &page.cursor {
            self.cursors.lock().await.insert(topic.scope.clone(), cursor.clone());
        }

        report.items_fetched += page.items.len();
        debug!(
            scope = %topic.scope,
            credential = %credential.display_name(),
            items = page.items.len(),
            "fetched page"
        );

        for (index, mut item) in page.items.into_iter().enumerate() {
            if index > 0 && !self.pause(self.config.item_pacing, token).await {
                return Ok(TopicEnd::Cancelled);
            }

            item.scope = topic.scope.clone();
            if item.destination.is_empty() {
                item.destination.clone_from(&topic.destination);
            }

            let result = self.pipeline.process(item).await;
            if result.skipped {
                report.items_skipped += 1;
            } else if result.success {
                report.items_accepted += 1;
            } else {
                report.items_failed += 1;
            }
        }

        Ok(TopicEnd::Done)
    }

    async fn on_fetch_failed(&self, topic: &Topic, error: ReliabilityError) -> Result<()> {
        let Some(call) = error.call_error() else {
            return Err(error.into());
        };
        warn!(
            scope = %topic.scope,
            kind = %FailureKind::from(call),
            error = %call,
            "upstream fetch failed"
        );

        match call {
            CallError::AuthFailed { .. } => match self.rotator.disable_current().await {
                Ok(next) => {
                    info!(credential = %next.display_name(), "continuing with next credential");
                },
                Err(exhausted) => {
                    return Err(PipelineError::poller_halted(format!(
                        "upstream rejected every credential ({exhausted})"
                    )));
                },
            },
            CallError::Throttled { .. } => {
                self.rotator.mark_error(call).await;
            },
            CallError::Timeout { .. } | CallError::Other { .. } => {
                self.rotator.mark_error(call).await;
                if self.rotator.is_unhealthy().await {
                    let next = self.rotator.rotate().await;
                    debug!(
                        credential = %next.display_name(),
                        "rotated away from unhealthy credential"
                    );
                }
            },
        }

        Ok(())
    }

    /// Sleeps for `duration` unless cancelled first. Returns false on cancel.
    async fn pause(&self, duration: Duration, token: &CancellationToken) -> bool {
        tokio::select! {
            () = self.clock.sleep(duration) => true,
            () = token.cancelled() => false,
        }
    }
}
