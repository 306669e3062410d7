//! Domain models shared across the relay.
//!
//! Identifiers are newtypes so an item id can never be passed where a scope
//! is expected. Timestamps that leave the process (snapshots, queue entries)
//! are wall-clock `DateTime<Utc>`; timestamps that only steer in-process
//! decisions use monotonic instants and live next to the component that
//! owns them.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Upstream identity of a fetched item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Wraps a raw upstream identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Delivery scope (topic) an item was fetched for.
///
/// Dedup is keyed by `(ItemId, Scope)`: the same upstream item may be
/// delivered once per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub String);

impl Scope {
    /// Wraps a scope name.
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// Returns the scope as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier assigned to a message when it enters the delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work fetched from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Upstream identity
    pub id: ItemId,
    /// Scope the item was fetched for
    pub scope: Scope,
    /// Downstream destination the item should be delivered to
    pub destination: String,
    /// Item body
    pub text: String,
    /// Author handle, when upstream supplied one
    pub author: Option<String>,
    /// Canonical link to the item
    pub url: Option<String>,
    /// Upstream publication time
    pub published_at: Option<DateTime<Utc>>,
    /// Free-form upstream attributes
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl WorkItem {
    /// Creates an item with the mandatory fields set.
    pub fn new(
        id: impl Into<String>,
        scope: impl Into<String>,
        destination: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: ItemId::new(id),
            scope: Scope::new(scope),
            destination: destination.into(),
            text: text.into(),
            author: None,
            url: None,
            published_at: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Sets the author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Sets the canonical link.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the publication time.
    #[must_use]
    pub const fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    /// Adds an upstream attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Secret material that never shows up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a raw secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the raw secret for use in an outbound request.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// An upstream credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Token presented to the upstream
    pub secret: Secret,
    /// Operator-facing label
    pub label: Option<String>,
}

impl Credential {
    /// Creates an unlabelled credential.
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: Secret::new(secret), label: None }
    }

    /// Attaches an operator-facing label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Stable identity derived from the secret.
    ///
    /// First 16 hex characters of the SHA-256 digest. Used to deduplicate
    /// the pool and to name credentials in logs without leaking them.
    pub fn signature(&self) -> String {
        let digest = Sha256::digest(self.secret.expose().as_bytes());
        let mut encoded = hex::encode(digest);
        encoded.truncate(16);
        encoded
    }

    /// Label when present, signature otherwise.
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.signature())
    }
}

/// A configured upstream query and where its results go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Scope name, also the dedup partition
    pub scope: Scope,
    /// Upstream search query
    pub query: String,
    /// Downstream destination
    pub destination: String,
    /// At least one of these must appear in the text (when non-empty)
    #[serde(default)]
    pub include: Vec<String>,
    /// None of these may appear in the text
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Topic {
    /// Creates a topic with no keyword filters.
    pub fn new(
        scope: impl Into<String>,
        query: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            scope: Scope::new(scope),
            query: query.into(),
            destination: destination.into(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Request handed to the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    /// Scope being polled
    pub scope: Scope,
    /// Upstream search query
    pub query: String,
    /// Resume position from the previous page
    pub cursor: Option<String>,
}

/// One page of upstream results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPage {
    /// Items in upstream order
    pub items: Vec<WorkItem>,
    /// Position to resume from on the next poll
    pub cursor: Option<String>,
}

/// Delivery options forwarded to the downstream sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Deliver without notifying the recipient
    #[serde(default)]
    pub silent: bool,
    /// Markup dialect of the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
}

/// Acknowledgement returned by the downstream sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Downstream reference for the delivered message
    pub message_ref: Option<String>,
}

/// Message submitted to the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Source item
    pub item_id: ItemId,
    /// Scope the item was accepted for
    pub scope: Scope,
    /// Downstream destination
    pub destination: String,
    /// Rendered body
    pub payload: String,
    /// Sender options
    pub options: SendOptions,
    /// Higher values drain first after `prioritize()`
    pub priority: i32,
}

impl NewMessage {
    /// Creates a message with default options and priority.
    pub fn new(
        item_id: ItemId,
        scope: Scope,
        destination: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            scope,
            destination: destination.into(),
            payload: payload.into(),
            options: SendOptions::default(),
            priority: 0,
        }
    }

    /// Sets the send options.
    #[must_use]
    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A message waiting in the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    /// Queue-assigned identifier
    pub id: MessageId,
    /// Source item
    pub item_id: ItemId,
    /// Scope the item was accepted for
    pub scope: Scope,
    /// Downstream destination
    pub destination: String,
    /// Rendered body
    pub payload: String,
    /// Sender options
    pub options: SendOptions,
    /// Drain priority, higher first after `prioritize()`
    pub priority: i32,
    /// Failed send attempts so far. Never decreases.
    pub retry_count: u32,
    /// Time of the first send attempt
    pub first_attempt_at: Option<DateTime<Utc>>,
    /// Time the message entered the queue
    pub enqueued_at: DateTime<Utc>,
}

/// Derived circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// A single trial call is admitted per test interval.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Portable circuit record for persistence across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Protected call category
    pub category: String,
    /// State derived at snapshot time
    pub state: CircuitState,
    /// Systemic failures since the last success
    pub failure_count: u32,
    /// Most recent counted failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Most recent half-open trial
    pub last_test_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_signature_is_stable_prefix() {
        let credential = Credential::new("token-a");
        let signature = credential.signature();

        assert_eq!(signature.len(), 16);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, Credential::new("token-a").with_label("primary").signature());
        assert_ne!(signature, Credential::new("token-b").signature());
    }

    #[test]
    fn secrets_never_rendered() {
        let credential = Credential::new("super-secret-value");

        assert!(!format!("{credential:?}").contains("super-secret-value"));
        assert_eq!(credential.secret.to_string(), "[redacted]");
        assert_eq!(credential.secret.expose(), "super-secret-value");
    }

    #[test]
    fn display_name_prefers_label() {
        let plain = Credential::new("abc");
        assert_eq!(plain.display_name(), plain.signature());

        let labelled = Credential::new("abc").with_label("backup");
        assert_eq!(labelled.display_name(), "backup");
    }

    #[test]
    fn topic_deserializes_without_filters() {
        let topic: Topic = serde_json::from_value(serde_json::json!({
            "scope": "rust",
            "query": "#rustlang",
            "destination": "chan-1"
        }))
        .unwrap();

        assert_eq!(topic.scope, Scope::new("rust"));
        assert!(topic.include.is_empty());
        assert!(topic.exclude.is_empty());
    }

    #[test]
    fn circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
