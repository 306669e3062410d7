//! Built-in stages and the canonical chain assembled from them.
//!
//! `validate → dedup → age → filter → render → enqueue | send`
//!
//! Every stage except the final delivery step is a local check and runs
//! under [`StagePolicy::NoRetry`]. Stages record what they decided in the
//! context metadata under the keys in [`keys`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use feedrelay_core::{
    CallError, Clock, DownstreamSender, NewMessage, Renderer, Scope, SeenStore, SendOptions,
    Topic, DOWNSTREAM_SEND,
};
use feedrelay_reliability::{CircuitBreaker, DeliveryQueue, ReliabilityError};
use tracing::debug;

use crate::{
    engine::{Pipeline, PipelineConfig},
    stage::{StageContext, StageExecutor, StageOutcome, StagePolicy},
};

/// Metadata keys written by the built-in stages.
pub mod keys {
    /// Validation result
    pub const VALIDATION: &str = "validation";
    /// Dedup lookup result
    pub const DEDUP: &str = "dedup";
    /// Item age in whole minutes, or null when undated
    pub const AGE_MINUTES: &str = "age_minutes";
    /// Keyword that let the item through, or null when unfiltered
    pub const FILTER: &str = "filter";
    /// Rendered payload
    pub const PAYLOAD: &str = "payload";
    /// Queue message id
    pub const MESSAGE_ID: &str = "message_id";
    /// Downstream message reference
    pub const MESSAGE_REF: &str = "message_ref";
}

/// Stage names used by [`standard_pipeline`].
pub mod names {
    /// [`super::ValidateStage`]
    pub const VALIDATE: &str = "validate";
    /// [`super::DedupStage`]
    pub const DEDUP: &str = "dedup";
    /// [`super::AgeWindowStage`]
    pub const AGE: &str = "age";
    /// [`super::KeywordFilterStage`]
    pub const FILTER: &str = "filter";
    /// [`super::RenderStage`]
    pub const RENDER: &str = "render";
    /// [`super::EnqueueStage`]
    pub const ENQUEUE: &str = "enqueue";
    /// [`super::SendStage`]
    pub const SEND: &str = "send";
}

/// Rejects items missing an id, text or destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateStage;

#[async_trait]
impl StageExecutor for ValidateStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let item = &ctx.item;
        let problem = if item.id.as_str().trim().is_empty() {
            Some("missing id")
        } else if item.text.trim().is_empty() {
            Some("empty text")
        } else if item.destination.trim().is_empty() {
            Some("no destination")
        } else {
            None
        };

        match problem {
            Some(reason) => {
                ctx.set(keys::VALIDATION, reason);
                Ok(StageOutcome::fail(reason))
            },
            None => {
                ctx.set(keys::VALIDATION, "passed");
                Ok(StageOutcome::Proceed)
            },
        }
    }
}

/// Skips items already delivered to their scope.
pub struct DedupStage {
    seen: Arc<dyn SeenStore>,
}

impl DedupStage {
    /// Creates the stage over `seen`.
    pub fn new(seen: Arc<dyn SeenStore>) -> Self {
        Self { seen }
    }
}

#[async_trait]
impl StageExecutor for DedupStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        if self.seen.has_seen(&ctx.item.id, &ctx.item.scope).await? {
            ctx.set(keys::DEDUP, "seen");
            return Ok(StageOutcome::skip("already delivered to this scope"));
        }

        ctx.set(keys::DEDUP, "new");
        Ok(StageOutcome::Proceed)
    }
}

/// Skips items published longer ago than `max_age`.
///
/// Undated items always pass. Items dated in the future count as zero
/// minutes old.
pub struct AgeWindowStage {
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl AgeWindowStage {
    /// Creates a window of `max_age`.
    pub fn new(max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { max_age, clock }
    }

    /// Creates a window of `minutes`.
    pub fn from_minutes(minutes: u64, clock: Arc<dyn Clock>) -> Self {
        Self::new(Duration::from_secs(minutes.saturating_mul(60)), clock)
    }
}

#[async_trait]
impl StageExecutor for AgeWindowStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let Some(published_at) = ctx.item.published_at else {
            ctx.set(keys::AGE_MINUTES, serde_json::Value::Null);
            return Ok(StageOutcome::Proceed);
        };

        let age = (self.clock.now_utc() - published_at).to_std().unwrap_or(Duration::ZERO);
        ctx.set(keys::AGE_MINUTES, age.as_secs() / 60);

        if age > self.max_age {
            return Ok(StageOutcome::skip(format!(
                "published {} minutes ago, window is {} minutes",
                age.as_secs() / 60,
                self.max_age.as_secs() / 60
            )));
        }
        Ok(StageOutcome::Proceed)
    }
}

/// Include and exclude keywords for one scope, lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct KeywordRule {
    include: Vec<String>,
    exclude: Vec<String>,
}

/// Applies per-scope include and exclude keywords, case-insensitively.
///
/// An item is skipped when it contains any exclude keyword, or when its
/// scope has include keywords and it contains none of them. Scopes without
/// rules let everything through.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilterStage {
    rules: HashMap<Scope, KeywordRule>,
}

impl KeywordFilterStage {
    /// Builds rules from each topic's keyword lists.
    pub fn from_topics(topics: &[Topic]) -> Self {
        let lower = |words: &[String]| -> Vec<String> {
            words
                .iter()
                .map(|word| word.trim().to_lowercase())
                .filter(|word| !word.is_empty())
                .collect()
        };

        let rules = topics
            .iter()
            .map(|topic| {
                let rule =
                    KeywordRule { include: lower(&topic.include), exclude: lower(&topic.exclude) };
                (topic.scope.clone(), rule)
            })
            .collect();

        Self { rules }
    }
}

#[async_trait]
impl StageExecutor for KeywordFilterStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let Some(rule) = self.rules.get(&ctx.item.scope) else {
            ctx.set(keys::FILTER, serde_json::Value::Null);
            return Ok(StageOutcome::Proceed);
        };
        let text = ctx.item.text.to_lowercase();

        if let Some(word) = rule.exclude.iter().find(|word| text.contains(word.as_str())) {
            return Ok(StageOutcome::skip(format!("contains excluded keyword '{word}'")));
        }
        if rule.include.is_empty() {
            ctx.set(keys::FILTER, serde_json::Value::Null);
            return Ok(StageOutcome::Proceed);
        }

        match rule.include.iter().find(|word| text.contains(word.as_str())) {
            Some(word) => {
                ctx.set(keys::FILTER, word.as_str());
                Ok(StageOutcome::Proceed)
            },
            None => Ok(StageOutcome::skip("no include keyword matched")),
        }
    }
}

/// Renders the item into its outbound payload.
pub struct RenderStage {
    renderer: Arc<dyn Renderer>,
}

impl RenderStage {
    /// Creates the stage over `renderer`.
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl StageExecutor for RenderStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let payload = self.renderer.render(&ctx.item)?;
        if payload.trim().is_empty() {
            return Ok(StageOutcome::fail("rendered payload is empty"));
        }

        ctx.set(keys::PAYLOAD, payload);
        Ok(StageOutcome::Proceed)
    }
}

/// Hands the rendered payload to the delivery queue.
pub struct EnqueueStage {
    queue: Arc<DeliveryQueue>,
    options: SendOptions,
}

impl EnqueueStage {
    /// Creates the stage over `queue`.
    pub fn new(queue: Arc<DeliveryQueue>, options: SendOptions) -> Self {
        Self { queue, options }
    }
}

#[async_trait]
impl StageExecutor for EnqueueStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let Some(payload) = ctx.get_str(keys::PAYLOAD) else {
            return Ok(StageOutcome::fail("nothing rendered to enqueue"));
        };

        let message = NewMessage::new(
            ctx.item.id.clone(),
            ctx.item.scope.clone(),
            ctx.item.destination.clone(),
            payload,
        )
        .with_options(self.options.clone());
        let id = self.queue.enqueue(message).await;

        ctx.set(keys::MESSAGE_ID, id.to_string());
        Ok(StageOutcome::Proceed)
    }
}

/// Sends the rendered payload straight downstream and marks the item seen.
///
/// Meant to run under [`StagePolicy::RetryWithBackoff`]. With a breaker
/// attached, sends go through its `downstream-send` circuit and an open
/// circuit fails the attempt without calling the sender.
pub struct SendStage {
    sender: Arc<dyn DownstreamSender>,
    seen: Arc<dyn SeenStore>,
    options: SendOptions,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl SendStage {
    /// Creates the stage.
    pub fn new(
        sender: Arc<dyn DownstreamSender>,
        seen: Arc<dyn SeenStore>,
        options: SendOptions,
    ) -> Self {
        Self { sender, seen, options, breaker: None }
    }

    /// Routes sends through the `downstream-send` circuit of `breaker`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

#[async_trait]
impl StageExecutor for SendStage {
    async fn execute(&self, ctx: &mut StageContext) -> Result<StageOutcome, CallError> {
        let Some(payload) = ctx.get_str(keys::PAYLOAD) else {
            return Ok(StageOutcome::fail("nothing rendered to send"));
        };

        let destination = ctx.item.destination.as_str();
        let send = || self.sender.send(destination, payload, &self.options);
        let receipt = match &self.breaker {
            Some(breaker) => breaker.execute(DOWNSTREAM_SEND, send).await.map_err(|e| match e {
                ReliabilityError::Call(error) => error,
                other => CallError::other(other.to_string()),
            })?,
            None => send().await?,
        };
        if let Err(error) = self.seen.mark_seen(&ctx.item.id, &ctx.item.scope).await {
            debug!(item_id = %ctx.item.id, error = %error, "sent but could not mark seen");
        }

        ctx.set(keys::MESSAGE_REF, receipt.message_ref.map_or(serde_json::Value::Null, Into::into));
        Ok(StageOutcome::Proceed)
    }
}

/// Final step of [`standard_pipeline`].
pub enum Delivery {
    /// Push into the delivery queue, which paces and retries.
    Queued(Arc<DeliveryQueue>),
    /// Send inline with stage-level retries, behind the breaker when given.
    Direct {
        /// Downstream channel
        sender: Arc<dyn DownstreamSender>,
        /// Breaker owning the `downstream-send` circuit
        breaker: Option<Arc<CircuitBreaker>>,
    },
}

/// Collaborators for [`standard_pipeline`].
pub struct StandardStages {
    /// Seen store for dedup and direct sends
    pub seen: Arc<dyn SeenStore>,
    /// Payload renderer
    pub renderer: Arc<dyn Renderer>,
    /// Topics supplying keyword rules
    pub topics: Vec<Topic>,
    /// Oldest item accepted
    pub max_age: Duration,
    /// Options attached to every outbound message
    pub send_options: SendOptions,
    /// Final step
    pub delivery: Delivery,
}

/// Assembles `validate → dedup → age → filter → render → enqueue | send`.
pub fn standard_pipeline(
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    stages: StandardStages,
) -> crate::error::Result<Pipeline> {
    let send_policy = config.send_policy();
    let mut pipeline = Pipeline::new(config, Arc::clone(&clock));

    pipeline.register_stage(names::VALIDATE, StagePolicy::NoRetry, ValidateStage)?;
    pipeline.register_stage(
        names::DEDUP,
        StagePolicy::NoRetry,
        DedupStage::new(Arc::clone(&stages.seen)),
    )?;
    pipeline.register_stage(
        names::AGE,
        StagePolicy::NoRetry,
        AgeWindowStage::new(stages.max_age, clock),
    )?;
    pipeline.register_stage(
        names::FILTER,
        StagePolicy::NoRetry,
        KeywordFilterStage::from_topics(&stages.topics),
    )?;
    pipeline.register_stage(
        names::RENDER,
        StagePolicy::NoRetry,
        RenderStage::new(stages.renderer),
    )?;

    match stages.delivery {
        Delivery::Queued(queue) => pipeline.register_stage(
            names::ENQUEUE,
            StagePolicy::NoRetry,
            EnqueueStage::new(queue, stages.send_options),
        )?,
        Delivery::Direct { sender, breaker } => {
            let mut stage = SendStage::new(sender, stages.seen, stages.send_options);
            if let Some(breaker) = breaker {
                stage = stage.with_circuit_breaker(breaker);
            }
            pipeline.register_stage(names::SEND, send_policy, stage)?;
        },
    }

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use feedrelay_core::{ItemId, MemorySeenStore, TestClock, WorkItem};
    use feedrelay_reliability::CircuitConfig;
    use feedrelay_testing::ScriptedSender;

    use super::*;

    fn ctx(item: WorkItem) -> StageContext {
        StageContext::new(item)
    }

    #[tokio::test]
    async fn validate_rejects_blank_text() {
        let mut context = ctx(WorkItem::new("1", "rust", "chan", "   "));

        let outcome = ValidateStage.execute(&mut context).await.unwrap();

        assert_eq!(outcome, StageOutcome::fail("empty text"));
        assert_eq!(context.get_str(keys::VALIDATION), Some("empty text"));
    }

    #[tokio::test]
    async fn dedup_skips_seen_items() {
        let seen = Arc::new(MemorySeenStore::new());
        seen.mark_seen(&ItemId::new("1"), &Scope::new("rust")).await.unwrap();
        let stage = DedupStage::new(seen);

        let mut same_scope = ctx(WorkItem::new("1", "rust", "chan", "text"));
        let mut other_scope = ctx(WorkItem::new("1", "go", "chan", "text"));

        assert!(matches!(
            stage.execute(&mut same_scope).await.unwrap(),
            StageOutcome::Skip { .. }
        ));
        assert_eq!(stage.execute(&mut other_scope).await.unwrap(), StageOutcome::Proceed);
    }

    #[tokio::test]
    async fn age_window_passes_undated_and_skips_stale() {
        let clock = TestClock::new();
        let stage = AgeWindowStage::from_minutes(30, Arc::new(clock.clone()));
        let now = clock.now_utc();

        let mut undated = ctx(WorkItem::new("1", "rust", "chan", "text"));
        let mut fresh = ctx(
            WorkItem::new("2", "rust", "chan", "text")
                .with_published_at(now - chrono::Duration::minutes(10)),
        );
        let mut stale = ctx(
            WorkItem::new("3", "rust", "chan", "text")
                .with_published_at(now - chrono::Duration::minutes(31)),
        );

        assert_eq!(stage.execute(&mut undated).await.unwrap(), StageOutcome::Proceed);
        assert_eq!(stage.execute(&mut fresh).await.unwrap(), StageOutcome::Proceed);
        assert!(matches!(stage.execute(&mut stale).await.unwrap(), StageOutcome::Skip { .. }));
        assert_eq!(fresh.get(keys::AGE_MINUTES), Some(&serde_json::Value::from(10)));
    }

    #[tokio::test]
    async fn keyword_filter_is_case_insensitive() {
        let mut topic = Topic::new("rust", "#rust", "chan");
        topic.include = vec!["Async".into()];
        topic.exclude = vec!["SPAM".into()];
        let stage = KeywordFilterStage::from_topics(&[topic]);

        let mut matching = ctx(WorkItem::new("1", "rust", "chan", "new ASYNC runtime"));
        let mut excluded = ctx(WorkItem::new("2", "rust", "chan", "async spam"));
        let mut unmatched = ctx(WorkItem::new("3", "rust", "chan", "borrow checker"));
        let mut unruled = ctx(WorkItem::new("4", "go", "chan", "anything"));

        assert_eq!(stage.execute(&mut matching).await.unwrap(), StageOutcome::Proceed);
        assert_eq!(matching.get_str(keys::FILTER), Some("async"));
        assert!(matches!(stage.execute(&mut excluded).await.unwrap(), StageOutcome::Skip { .. }));
        assert!(matches!(stage.execute(&mut unmatched).await.unwrap(), StageOutcome::Skip { .. }));
        assert_eq!(stage.execute(&mut unruled).await.unwrap(), StageOutcome::Proceed);
    }

    #[tokio::test]
    async fn enqueue_requires_rendered_payload() {
        let queue = Arc::new(DeliveryQueue::new(
            feedrelay_reliability::QueueConfig::default(),
            Arc::new(ScriptedSender::new()),
            Arc::new(MemorySeenStore::new()),
            Arc::new(TestClock::new()),
        ));
        let stage = EnqueueStage::new(Arc::clone(&queue), SendOptions::default());
        let mut context = ctx(WorkItem::new("1", "rust", "chan", "text"));

        assert!(matches!(stage.execute(&mut context).await.unwrap(), StageOutcome::Fail { .. }));

        context.set(keys::PAYLOAD, "rendered");
        assert_eq!(stage.execute(&mut context).await.unwrap(), StageOutcome::Proceed);
        assert!(context.contains(keys::MESSAGE_ID));
        assert_eq!(queue.status().await.queue_length, 1);
    }

    #[tokio::test]
    async fn send_respects_open_downstream_circuit() {
        let clock = TestClock::new();
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitConfig {
                threshold: 1,
                reset_timeout: Duration::from_secs(60),
                test_interval: Duration::from_secs(10),
            },
            Arc::new(clock.clone()),
        ));
        breaker.record_failure(DOWNSTREAM_SEND, &CallError::other("down")).await;

        let sender = ScriptedSender::new();
        let seen = Arc::new(MemorySeenStore::new());
        let stage = SendStage::new(Arc::new(sender.clone()), seen.clone(), SendOptions::default())
            .with_circuit_breaker(Arc::clone(&breaker));
        let mut context = ctx(WorkItem::new("1", "rust", "chan", "text"));
        context.set(keys::PAYLOAD, "rendered");

        let error = stage.execute(&mut context).await.unwrap_err();
        assert!(error.to_string().contains("circuit breaker open"));
        assert_eq!(sender.attempt_count(), 0);
        assert!(!seen.has_seen(&ItemId::new("1"), &Scope::new("rust")).await.unwrap());

        clock.advance(Duration::from_secs(61));

        assert_eq!(stage.execute(&mut context).await.unwrap(), StageOutcome::Proceed);
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(breaker.stats(DOWNSTREAM_SEND).await.map(|s| s.failure_count), Some(0));
    }
}
