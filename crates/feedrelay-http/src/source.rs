//! Upstream feed client.
//!
//! `GET {base}/search?q=<query>[&cursor=<cursor>]` with the credential as a
//! bearer token. The response body is
//!
//! ```json
//! {
//!   "items": [
//!     { "id": "1", "text": "...", "author": "ferris",
//!       "url": "https://...", "published_at": "2024-05-01T12:00:00Z" }
//!   ],
//!   "next_cursor": "abc"
//! }
//! ```
//!
//! Items come back without a destination; the poller fills it from the
//! topic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedrelay_core::{
    CallError, Credential, FetchPage, FetchQuery, ItemId, UpstreamSource, WorkItem,
};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::{
    classify::{classify_status, classify_transport},
    config::{endpoint, ClientConfig},
    error::Result,
};

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<FeedItem>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    id: String,
    text: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

impl FeedItem {
    fn into_work_item(self, query: &FetchQuery) -> WorkItem {
        WorkItem {
            id: ItemId::new(self.id),
            scope: query.scope.clone(),
            destination: String::new(),
            text: self.text,
            author: self.author,
            url: self.url,
            published_at: self.published_at,
            attributes: self.attributes,
        }
    }
}

/// [`UpstreamSource`] over a JSON search endpoint.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    search_url: Url,
    config: ClientConfig,
}

impl HttpFeedSource {
    /// Creates a source rooted at `base_url`.
    pub fn new(base_url: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            search_url: endpoint(base_url, "search")?,
            config,
        })
    }
}

#[async_trait]
impl UpstreamSource for HttpFeedSource {
    async fn fetch(
        &self,
        query: &FetchQuery,
        credential: &Credential,
    ) -> std::result::Result<FetchPage, CallError> {
        let span = info_span!(
            "upstream_fetch",
            scope = %query.scope,
            credential = %credential.display_name()
        );

        async move {
            let mut request = self
                .client
                .get(self.search_url.clone())
                .bearer_auth(credential.secret.expose())
                .query(&[("q", query.query.as_str())]);
            if let Some(cursor) = &query.cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify_transport(&e, self.config.timeout))?;
            let status = response.status();
            if !status.is_success() {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &headers, &body));
            }

            let feed: FeedResponse = response.json().await.map_err(|e| {
                if e.is_decode() {
                    CallError::other(format!("malformed feed response: {e}"))
                } else {
                    classify_transport(&e, self.config.timeout)
                }
            })?;
            debug!(items = feed.items.len(), next_cursor = ?feed.next_cursor, "feed page received");

            Ok(FetchPage {
                items: feed.items.into_iter().map(|item| item.into_work_item(query)).collect(),
                cursor: feed.next_cursor,
            })
        }
        .instrument(span)
        .await
    }
}
