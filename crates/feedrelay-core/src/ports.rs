//! Collaborator ports consumed by the reliability layer.
//!
//! ```text
//!   ┌──────────────────┐  fetch   ┌───────────┐  enqueue  ┌───────────────┐
//!   │  UpstreamSource  │ ───────▶ │  Pipeline │ ────────▶ │ DeliveryQueue │
//!   └──────────────────┘          └───────────┘           └───────────────┘
//!            ▲                      │ has_seen                  │ send
//!            │ credential           ▼                           ▼
//!   ┌──────────────────┐      ┌───────────┐  mark_seen  ┌──────────────────┐
//!   │ CredentialRotator│      │ SeenStore │ ◀────────── │ DownstreamSender │
//!   └──────────────────┘      └───────────┘             └──────────────────┘
//! ```
//!
//! Implementations normalize their raw failures into [`CallError`] before
//! returning. Nothing downstream of a port inspects status codes or message
//! text.

use async_trait::async_trait;

use crate::{
    error::CallError,
    models::{
        CircuitSnapshot, Credential, FetchPage, FetchQuery, ItemId, Scope, SendOptions,
        SendReceipt, WorkItem,
    },
};

/// Rate-limited, credential-gated feed source.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetches the next page of items for `query` using `credential`.
    async fn fetch(&self, query: &FetchQuery, credential: &Credential)
        -> Result<FetchPage, CallError>;
}

/// Record of which items were already delivered per scope.
#[async_trait]
pub trait SeenStore: Send + Sync {
    /// True when `item` was already delivered to `scope`.
    async fn has_seen(&self, item: &ItemId, scope: &Scope) -> Result<bool, CallError>;

    /// Records delivery of `item` to `scope`. Idempotent.
    async fn mark_seen(&self, item: &ItemId, scope: &Scope) -> Result<(), CallError>;
}

/// Rate-limited downstream channel.
#[async_trait]
pub trait DownstreamSender: Send + Sync {
    /// Delivers `payload` to `destination`.
    ///
    /// A throttle response is reported as [`CallError::Throttled`] carrying
    /// the channel's retry hint.
    async fn send(
        &self,
        destination: &str,
        payload: &str,
        options: &SendOptions,
    ) -> Result<SendReceipt, CallError>;
}

/// Optional persistence for circuit records across restarts.
#[async_trait]
pub trait CircuitStateStore: Send + Sync {
    /// Stores the latest snapshot for `category`.
    async fn save(&self, category: &str, snapshot: &CircuitSnapshot) -> Result<(), CallError>;

    /// Loads the stored snapshot for `category`, if any.
    async fn load(&self, category: &str) -> Result<Option<CircuitSnapshot>, CallError>;
}

/// Turns an accepted item into a downstream payload.
pub trait Renderer: Send + Sync {
    /// Renders `item` into the text delivered downstream.
    fn render(&self, item: &WorkItem) -> Result<String, CallError>;
}

/// Minimal text template: author line, body, link.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, item: &WorkItem) -> Result<String, CallError> {
        let mut lines = Vec::with_capacity(3);
        if let Some(author) = &item.author {
            lines.push(format!("@{author}"));
        }
        lines.push(item.text.trim().to_string());
        if let Some(url) = &item.url {
            lines.push(url.clone());
        }
        Ok(lines.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_renderer_includes_author_and_link() {
        let item = WorkItem::new("1", "rust", "chan", "  hello world ")
            .with_author("ferris")
            .with_url("https://example.com/1");

        let rendered = PlainRenderer.render(&item).unwrap();

        assert_eq!(rendered, "@ferris\n\nhello world\n\nhttps://example.com/1");
    }

    #[test]
    fn plain_renderer_body_only() {
        let item = WorkItem::new("1", "rust", "chan", "just text");

        assert_eq!(PlainRenderer.render(&item).unwrap(), "just text");
    }
}
