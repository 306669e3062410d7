//! Downstream webhook sender.
//!
//! `POST {base}/messages` with a JSON body
//! `{"destination", "text", "silent", "parse_mode"}` and an optional bearer
//! token. A `message_id` in the JSON response becomes the receipt's
//! reference; any other success body is accepted as-is.

use async_trait::async_trait;
use feedrelay_core::{CallError, DownstreamSender, Secret, SendOptions, SendReceipt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

use crate::{
    classify::{classify_status, classify_transport},
    config::{endpoint, ClientConfig},
    error::Result,
};

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    destination: &'a str,
    text: &'a str,
    silent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    message_id: Option<serde_json::Value>,
}

/// [`DownstreamSender`] posting JSON to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: reqwest::Client,
    messages_url: Url,
    token: Option<Secret>,
    config: ClientConfig,
}

impl WebhookSender {
    /// Creates a sender rooted at `base_url`.
    pub fn new(base_url: &str, token: Option<Secret>, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            messages_url: endpoint(base_url, "messages")?,
            token,
            config,
        })
    }
}

#[async_trait]
impl DownstreamSender for WebhookSender {
    async fn send(
        &self,
        destination: &str,
        payload: &str,
        options: &SendOptions,
    ) -> std::result::Result<SendReceipt, CallError> {
        let span = info_span!("downstream_send", destination, bytes = payload.len());

        async move {
            let body = OutboundMessage {
                destination,
                text: payload,
                silent: options.silent,
                parse_mode: options.parse_mode.as_deref(),
            };
            let mut request = self.client.post(self.messages_url.clone()).json(&body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token.expose());
            }

            let response = request
                .send()
                .await
                .map_err(|e| classify_transport(&e, self.config.timeout))?;
            let status = response.status();
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(classify_status(status, &headers, &text));
            }

            let parsed: SendResponse = serde_json::from_str(&text).unwrap_or_default();
            let message_ref = parsed.message_id.map(|id| match id {
                serde_json::Value::String(id) => id,
                other => other.to_string(),
            });
            debug!(status = status.as_u16(), message_ref = ?message_ref, "message accepted");

            Ok(SendReceipt { message_ref })
        }
        .instrument(span)
        .await
    }
}
