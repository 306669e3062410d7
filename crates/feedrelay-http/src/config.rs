//! Shared reqwest client settings.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{HttpError, Result};

/// Settings shared by the feed source and the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for a whole request, response body included.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("feedrelay/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
        }
    }
}

impl ClientConfig {
    pub(crate) fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects))
            .build()
            .map_err(|e| HttpError::configuration(format!("failed to build HTTP client: {e}")))
    }
}

/// Parses `base` and appends `path` to it.
pub(crate) fn endpoint(base: &str, path: &str) -> Result<Url> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| HttpError::invalid_url(base, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let url = endpoint("https://feed.example/api/", "/search").unwrap();

        assert_eq!(url.as_str(), "https://feed.example/api/search");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        let error = endpoint("not a url", "search").unwrap_err();

        assert!(matches!(error, HttpError::InvalidUrl { .. }));
    }

    #[test]
    fn default_user_agent_carries_version() {
        assert!(ClientConfig::default().user_agent.starts_with("feedrelay/"));
    }
}
