//! Adaptive single-lane delivery queue.
//!
//! Messages drain one at a time. Before each send the drain loop waits the
//! current pacing delay, which grows when the downstream channel throttles
//! and decays back toward the base delay once throttling stops.
//!
//! ```text
//!   tick (100ms) ──▶ paused? sending? empty? ──yes──▶ wait for next tick
//!                               │ no
//!                               ▼
//!                    wait current_delay, send head
//!                               │
//!        ┌──────────────┬───────┴───────┬──────────────────┐
//!        ▼              ▼               ▼                  ▼
//!    delivered      throttled        failed          retries spent
//!   remove, mark   move to tail,   stay at head     dead-letter, log
//!   seen, decay    grow delay
//! ```
//!
//! An auth rejection is not retried. The message stays at the head with
//! its retry count untouched and the queue pauses until [`DeliveryQueue::resume`].
//!
//! A throttled message is always moved behind the other pending messages,
//! so global FIFO order does not hold under sustained throttling.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use feedrelay_core::{
    CallError, Clock, DownstreamSender, MessageId, NewMessage, QueuedMessage, SeenStore,
    DOWNSTREAM_SEND,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{circuit::CircuitBreaker, error::ReliabilityError};

/// Pacing and retry limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Floor of the pacing delay.
    pub base_delay: Duration,
    /// Ceiling of the pacing delay when no retry hint exceeds it.
    pub max_delay: Duration,
    /// Failed attempts after which a message is dead-lettered.
    pub max_retries: u32,
    /// Scheduling granularity of the drain loop.
    pub tick_interval: Duration,
    /// Quiet period after a throttle before the delay starts to decay.
    pub decay_after: Duration,
    /// Dead letters retained for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            max_retries: 3,
            tick_interval: Duration::from_millis(100),
            decay_after: Duration::from_secs(10),
            dead_letter_capacity: 1000,
        }
    }
}

/// Snapshot of the queue for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub is_paused: bool,
    pub is_sending: bool,
    pub current_delay: Duration,
    /// Messages delivered since startup.
    pub delivered: u64,
    /// Messages dead-lettered since startup.
    pub dead_lettered: u64,
}

/// A message dropped after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: QueuedMessage,
    /// Failure of the final attempt.
    pub error: CallError,
    pub dead_lettered_at: DateTime<Utc>,
}

/// What a single drain step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Sent and removed.
    Delivered(MessageId),
    /// Throttled and moved to the tail.
    Throttled(MessageId),
    /// Failed, left at the head for the next tick.
    Retrying(MessageId),
    /// Retries exhausted and removed.
    DeadLettered(MessageId),
    /// The downstream circuit was open. Nothing changed.
    Blocked(MessageId),
    /// The channel rejected our credentials. Left at the head and the
    /// queue paused until an operator resumes it.
    AuthRejected(MessageId),
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<QueuedMessage>,
    current_delay: Duration,
    is_paused: bool,
    is_sending: bool,
    last_throttle_at: Option<Instant>,
    delivered: u64,
    dead_lettered: u64,
    dead_letters: VecDeque<DeadLetter>,
}

/// Outbound queue draining to a [`DownstreamSender`].
pub struct DeliveryQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn DownstreamSender>,
    seen: Arc<dyn SeenStore>,
    breaker: Option<Arc<CircuitBreaker>>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.config)
            .field("breaker", &self.breaker.is_some())
            .finish_non_exhaustive()
    }
}

impl DeliveryQueue {
    /// Creates an empty, running queue paced at `base_delay`.
    pub fn new(
        config: QueueConfig,
        sender: Arc<dyn DownstreamSender>,
        seen: Arc<dyn SeenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = QueueState {
            messages: VecDeque::new(),
            current_delay: config.base_delay,
            is_paused: false,
            is_sending: false,
            last_throttle_at: None,
            delivered: 0,
            dead_lettered: 0,
            dead_letters: VecDeque::new(),
        };

        Self { config, clock, sender, seen, breaker: None, state: Mutex::new(state) }
    }

    /// Routes sends through the `downstream-send` circuit of `breaker`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Appends a message to the tail.
    ///
    /// A message for an `(item, scope)` pair that is already queued is not
    /// added again; the id of the queued one is returned.
    pub async fn enqueue(&self, message: NewMessage) -> MessageId {
        let enqueued_at = self.clock.now_utc();
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .messages
            .iter()
            .find(|queued| queued.item_id == message.item_id && queued.scope == message.scope)
        {
            debug!(message_id = %existing.id, item_id = %message.item_id, "message already queued");
            return existing.id;
        }

        let id = MessageId::new();
        state.messages.push_back(QueuedMessage {
            id,
            item_id: message.item_id,
            scope: message.scope,
            destination: message.destination,
            payload: message.payload,
            options: message.options,
            priority: message.priority,
            retry_count: 0,
            first_attempt_at: None,
            enqueued_at,
        });

        debug!(message_id = %id, queue_length = state.messages.len(), "message enqueued");
        id
    }

    /// Current queue status.
    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            queue_length: state.messages.len(),
            is_paused: state.is_paused,
            is_sending: state.is_sending,
            current_delay: state.current_delay,
            delivered: state.delivered,
            dead_lettered: state.dead_lettered,
        }
    }

    /// Stops draining after the in-flight send, if any.
    pub async fn pause(&self) {
        self.state.lock().await.is_paused = true;
        info!("delivery queue paused");
    }

    /// Resumes draining.
    pub async fn resume(&self) {
        self.state.lock().await.is_paused = false;
        info!("delivery queue resumed");
    }

    /// Stable sort by descending priority.
    pub async fn prioritize(&self) {
        let mut state = self.state.lock().await;
        state.messages.make_contiguous().sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Pending messages in drain order.
    pub async fn pending(&self) -> Vec<QueuedMessage> {
        self.state.lock().await.messages.iter().cloned().collect()
    }

    /// Retained dead letters, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.iter().cloned().collect()
    }

    /// Waits the pacing delay and attempts the head message once.
    ///
    /// Returns `None` when paused, already sending, or empty.
    pub async fn drain_once(&self) -> Option<DrainOutcome> {
        let delay = self.begin_drain().await?;
        self.clock.sleep(delay).await;
        self.send_head().await
    }

    /// Drain loop. Returns once `token` is cancelled; an in-flight send
    /// always completes first.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            base_delay_ms = duration_ms(self.config.base_delay),
            max_retries = self.config.max_retries,
            "delivery queue starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.tick_interval) => {}
                () = token.cancelled() => break,
            }

            let Some(delay) = self.begin_drain().await else {
                continue;
            };

            tokio::select! {
                () = self.clock.sleep(delay) => {}
                () = token.cancelled() => {
                    self.state.lock().await.is_sending = false;
                    break;
                }
            }

            self.send_head().await;
        }

        info!("delivery queue stopped");
    }

    /// Spawns [`Self::run`] on the runtime.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }

    /// Claims the send slot and returns the pacing delay to wait.
    async fn begin_drain(&self) -> Option<Duration> {
        let mut state = self.state.lock().await;
        if state.is_paused || state.is_sending || state.messages.is_empty() {
            return None;
        }
        state.is_sending = true;
        Some(state.current_delay)
    }

    /// Sends the current head and applies the outcome. Releases the send slot.
    async fn send_head(&self) -> Option<DrainOutcome> {
        let head = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_utc();
            let head = if state.is_paused {
                None
            } else {
                state.messages.front_mut().map(|message| {
                    message.first_attempt_at.get_or_insert(now);
                    message.clone()
                })
            };
            if head.is_none() {
                state.is_sending = false;
            }
            head
        }?;

        let outcome = match self.dispatch(&head).await {
            Ok(()) => self.on_delivered(&head).await,
            Err(ReliabilityError::CircuitOpen { .. }) => {
                debug!(message_id = %head.id, "downstream circuit open, send deferred");
                DrainOutcome::Blocked(head.id)
            },
            Err(ReliabilityError::Call(error)) => self.on_failed(&head, error).await,
            Err(other) => self.on_failed(&head, CallError::other(other.to_string())).await,
        };

        self.state.lock().await.is_sending = false;
        Some(outcome)
    }

    async fn dispatch(&self, message: &QueuedMessage) -> Result<(), ReliabilityError> {
        let send = || async {
            self.sender.send(&message.destination, &message.payload, &message.options).await
        };

        match &self.breaker {
            Some(breaker) => breaker.execute(DOWNSTREAM_SEND, send).await.map(|_| ()),
            None => send().await.map(|_| ()).map_err(ReliabilityError::from),
        }
    }

    async fn on_delivered(&self, message: &QueuedMessage) -> DrainOutcome {
        if let Err(error) = self.seen.mark_seen(&message.item_id, &message.scope).await {
            warn!(
                message_id = %message.id,
                item_id = %message.item_id,
                error = %error,
                "delivered but failed to mark item seen"
            );
        }

        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.messages.retain(|queued| queued.id != message.id);
        state.delivered += 1;

        let quiet = state
            .last_throttle_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.decay_after);
        if quiet && state.current_delay > self.config.base_delay {
            state.current_delay = (state.current_delay / 2).max(self.config.base_delay);
            debug!(current_delay_ms = duration_ms(state.current_delay), "pacing delay decayed");
        }

        debug!(
            message_id = %message.id,
            destination = %message.destination,
            attempts = message.retry_count + 1,
            "message delivered"
        );
        DrainOutcome::Delivered(message.id)
    }

    #[allow(clippy::significant_drop_tightening)] // Relocation and delay update must be atomic
    async fn on_failed(&self, message: &QueuedMessage, error: CallError) -> DrainOutcome {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if error.is_auth() {
            state.is_paused = true;
            error!(
                message_id = %message.id,
                destination = %message.destination,
                pending = state.messages.len(),
                error = %error,
                "downstream rejected credentials, delivery queue paused"
            );
            return DrainOutcome::AuthRejected(message.id);
        }

        let Some(position) = state.messages.iter().position(|queued| queued.id == message.id)
        else {
            return DrainOutcome::Retrying(message.id);
        };
        let Some(mut queued) = state.messages.remove(position) else {
            return DrainOutcome::Retrying(message.id);
        };
        queued.retry_count = queued.retry_count.saturating_add(1);

        if queued.retry_count >= self.config.max_retries {
            error!(
                message_id = %queued.id,
                item_id = %queued.item_id,
                destination = %queued.destination,
                attempts = queued.retry_count,
                error = %error,
                "message dead-lettered after exhausting retries"
            );
            state.dead_lettered += 1;
            if state.dead_letters.len() >= self.config.dead_letter_capacity {
                state.dead_letters.pop_front();
            }
            state.dead_letters.push_back(DeadLetter {
                message: queued,
                error,
                dead_lettered_at: self.clock.now_utc(),
            });
            return DrainOutcome::DeadLettered(message.id);
        }

        if error.is_throttle() {
            let doubled = state.current_delay.saturating_mul(2).min(self.config.max_delay);
            state.current_delay = error.retry_after().map_or(doubled, |hint| hint.max(doubled));
            state.last_throttle_at = Some(now);

            warn!(
                message_id = %queued.id,
                retry_count = queued.retry_count,
                current_delay_ms = duration_ms(state.current_delay),
                "downstream throttled, message moved to tail"
            );
            state.messages.push_back(queued);
            return DrainOutcome::Throttled(message.id);
        }

        warn!(
            message_id = %queued.id,
            retry_count = queued.retry_count,
            error = %error,
            "send failed, retrying at head"
        );
        state.messages.insert(position, queued);
        DrainOutcome::Retrying(message.id)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use feedrelay_core::{ItemId, MemorySeenStore, RealClock, Scope};
    use feedrelay_testing::ScriptedSender;

    use super::*;

    fn message(id: &str) -> NewMessage {
        NewMessage::new(ItemId::new(id), Scope::new("rust"), "chan-1", format!("payload {id}"))
    }

    fn queue(sender: Arc<ScriptedSender>) -> DeliveryQueue {
        DeliveryQueue::new(
            QueueConfig::default(),
            sender,
            Arc::new(MemorySeenStore::new()),
            Arc::new(RealClock::new()),
        )
    }

    #[tokio::test]
    async fn duplicate_item_scope_not_queued_twice() {
        let queue = queue(Arc::new(ScriptedSender::new()));

        let first = queue.enqueue(message("1")).await;
        let second = queue.enqueue(message("1")).await;

        assert_eq!(first, second);
        assert_eq!(queue.status().await.queue_length, 1);
    }

    #[tokio::test]
    async fn prioritize_is_stable_descending() {
        let queue = queue(Arc::new(ScriptedSender::new()));
        queue.enqueue(message("low-a")).await;
        queue.enqueue(message("high").with_priority(5)).await;
        queue.enqueue(message("low-b")).await;
        queue.enqueue(message("mid").with_priority(2)).await;

        queue.prioritize().await;

        let order: Vec<String> =
            queue.pending().await.into_iter().map(|m| m.item_id.to_string()).collect();
        assert_eq!(order, ["high", "mid", "low-a", "low-b"]);
    }

    #[tokio::test]
    async fn paused_queue_does_not_drain() {
        let sender = Arc::new(ScriptedSender::new());
        let queue = queue(Arc::clone(&sender));
        queue.enqueue(message("1")).await;

        queue.pause().await;
        assert_eq!(queue.drain_once().await, None);
        assert!(queue.status().await.is_paused);

        queue.resume().await;
        assert!(!queue.status().await.is_paused);
        assert_eq!(sender.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttle_failure_keeps_head() {
        let sender = Arc::new(ScriptedSender::new());
        sender.push_failure(CallError::other("502"));
        let queue = queue(Arc::clone(&sender));
        let first = queue.enqueue(message("1")).await;
        queue.enqueue(message("2")).await;

        assert_eq!(queue.drain_once().await, Some(DrainOutcome::Retrying(first)));

        let pending = queue.pending().await;
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].first_attempt_at.is_some());
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_without_hint_doubles_delay_up_to_max() {
        let sender = Arc::new(ScriptedSender::new());
        for _ in 0..2 {
            sender.push_failure(CallError::throttled(None));
        }
        let config = QueueConfig {
            max_delay: Duration::from_millis(3000),
            max_retries: 10,
            ..QueueConfig::default()
        };
        let queue = DeliveryQueue::new(
            config,
            sender,
            Arc::new(MemorySeenStore::new()),
            Arc::new(RealClock::new()),
        );
        queue.enqueue(message("1")).await;

        queue.drain_once().await;
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(2000));

        queue.drain_once().await;
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_decays_only_after_quiet_period() {
        let sender = Arc::new(ScriptedSender::new());
        sender.push_failure(CallError::throttled(Some(Duration::from_millis(8000))));
        let queue = queue(Arc::clone(&sender));
        queue.enqueue(message("1")).await;
        queue.enqueue(message("2")).await;

        queue.drain_once().await;
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(8000));

        // Delivered 8s after the throttle: still inside the quiet period.
        queue.drain_once().await;
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(8000));

        // Delivered 16s after the throttle: halves.
        queue.drain_once().await;
        assert_eq!(queue.status().await.current_delay, Duration::from_millis(4000));
        assert_eq!(queue.status().await.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_message_marked_seen() {
        let sender = Arc::new(ScriptedSender::new());
        let seen = Arc::new(MemorySeenStore::new());
        let queue = DeliveryQueue::new(
            QueueConfig::default(),
            Arc::clone(&sender) as Arc<dyn DownstreamSender>,
            Arc::clone(&seen) as Arc<dyn SeenStore>,
            Arc::new(RealClock::new()),
        );
        let id = queue.enqueue(message("1")).await;

        assert_eq!(queue.drain_once().await, Some(DrainOutcome::Delivered(id)));

        assert!(seen.has_seen(&ItemId::new("1"), &Scope::new("rust")).await.unwrap());
        assert_eq!(queue.status().await.queue_length, 0);
        assert_eq!(sender.sent_count(), 1);
    }
}
