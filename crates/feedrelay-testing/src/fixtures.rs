//! Builders with sensible defaults for items, topics and credential pools.

use chrono::{DateTime, Duration, Utc};
use feedrelay_core::{Credential, Topic, WorkItem};

/// Default scope used by fixtures.
pub const SCOPE: &str = "rust";

/// Default destination used by fixtures.
pub const DESTINATION: &str = "chan-1";

/// An item in the default scope, published now.
pub fn item(id: &str) -> WorkItem {
    ItemBuilder::new(id).build()
}

/// A topic in `scope` delivering to the default destination.
pub fn topic(scope: &str) -> Topic {
    Topic::new(scope, format!("#{scope}"), DESTINATION)
}

/// A pool of `size` labelled credentials (`cred-0`, `cred-1`, ...).
pub fn credentials(size: usize) -> Vec<Credential> {
    (0..size)
        .map(|index| Credential::new(format!("secret-{index}")).with_label(format!("cred-{index}")))
        .collect()
}

/// Builder for [`WorkItem`] fixtures.
#[derive(Debug, Clone)]
pub struct ItemBuilder {
    item: WorkItem,
}

impl ItemBuilder {
    /// Starts an item with default scope, destination and text.
    pub fn new(id: &str) -> Self {
        let item = WorkItem::new(id, SCOPE, DESTINATION, format!("item {id} about rust"))
            .with_author("ferris")
            .with_url(format!("https://feed.example/{id}"))
            .with_published_at(Utc::now());
        Self { item }
    }

    /// Sets the scope.
    #[must_use]
    pub fn scope(mut self, scope: &str) -> Self {
        self.item.scope = scope.into();
        self
    }

    /// Sets the body text.
    #[must_use]
    pub fn text(mut self, text: &str) -> Self {
        self.item.text = text.to_string();
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn destination(mut self, destination: &str) -> Self {
        self.item.destination = destination.to_string();
        self
    }

    /// Publishes the item `minutes` before now.
    #[must_use]
    pub fn aged_minutes(mut self, minutes: i64) -> Self {
        self.item.published_at = Some(Utc::now() - Duration::minutes(minutes));
        self
    }

    /// Sets an explicit publication time.
    #[must_use]
    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.item.published_at = Some(at);
        self
    }

    /// Removes the publication time.
    #[must_use]
    pub fn undated(mut self) -> Self {
        self.item.published_at = None;
        self
    }

    /// Finishes the item.
    pub fn build(self) -> WorkItem {
        self.item
    }
}
