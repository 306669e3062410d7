//! Integration tests for the feed source and webhook sender.
//!
//! Every test runs against a wiremock server and checks the request shape
//! and the normalized outcome.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::time::Duration;

use feedrelay_core::{
    CallError, Credential, DownstreamSender, FetchQuery, Scope, Secret, SendOptions,
    UpstreamSource,
};
use feedrelay_http::{ClientConfig, HttpFeedSource, WebhookSender};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn query(cursor: Option<&str>) -> FetchQuery {
    FetchQuery {
        scope: Scope::new("rust"),
        query: "#rust".to_string(),
        cursor: cursor.map(str::to_string),
    }
}

fn credential() -> Credential {
    Credential::new("token-a").with_label("primary")
}

#[tokio::test]
async fn fetch_parses_items_and_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "#rust"))
        .and(query_param("cursor", "c1"))
        .and(header("authorization", "Bearer token-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": "42",
                    "text": "ferris ships a release",
                    "author": "ferris",
                    "url": "https://feed.example/42",
                    "published_at": "2024-05-01T12:00:00Z",
                    "attributes": { "lang": "en" }
                },
                { "id": "43", "text": "second item" }
            ],
            "next_cursor": "c2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = HttpFeedSource::new(&server.uri(), ClientConfig::default()).unwrap();
    let page = source.fetch(&query(Some("c1")), &credential()).await.unwrap();

    assert_eq!(page.cursor.as_deref(), Some("c2"));
    assert_eq!(page.items.len(), 2);
    let first = &page.items[0];
    assert_eq!(first.id.as_str(), "42");
    assert_eq!(first.scope.as_str(), "rust");
    assert!(first.destination.is_empty());
    assert_eq!(first.author.as_deref(), Some("ferris"));
    assert_eq!(first.attributes.get("lang").map(String::as_str), Some("en"));
    assert!(first.published_at.is_some());
    assert!(page.items[1].published_at.is_none());
}

#[tokio::test]
async fn fetch_429_is_throttle_with_header_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
        .mount(&server)
        .await;

    let source = HttpFeedSource::new(&server.uri(), ClientConfig::default()).unwrap();
    let error = source.fetch(&query(None), &credential()).await.unwrap_err();

    assert_eq!(error, CallError::throttled(Some(Duration::from_secs(120))));
}

#[tokio::test]
async fn fetch_401_is_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let source = HttpFeedSource::new(&server.uri(), ClientConfig::default()).unwrap();
    let error = source.fetch(&query(None), &credential()).await.unwrap_err();

    assert!(error.is_auth());
    assert!(error.to_string().contains("bad token"));
}

#[tokio::test]
async fn fetch_500_is_generic_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let source = HttpFeedSource::new(&server.uri(), ClientConfig::default()).unwrap();
    let error = source.fetch(&query(None), &credential()).await.unwrap_err();

    assert_eq!(error, CallError::other("HTTP 500: boom"));
}

#[tokio::test]
async fn fetch_malformed_body_is_generic_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let source = HttpFeedSource::new(&server.uri(), ClientConfig::default()).unwrap();
    let error = source.fetch(&query(None), &credential()).await.unwrap_err();

    match error {
        CallError::Other { message } => assert!(message.starts_with("malformed feed response")),
        other => panic!("expected generic failure, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "items": [] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let config = ClientConfig { timeout: Duration::from_millis(100), ..ClientConfig::default() };
    let source = HttpFeedSource::new(&server.uri(), config).unwrap();
    let error = source.fetch(&query(None), &credential()).await.unwrap_err();

    assert_eq!(error, CallError::timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn send_posts_message_and_returns_receipt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("authorization", "Bearer bot-token"))
        .and(body_json(json!({
            "destination": "chan-1",
            "text": "hello",
            "silent": true,
            "parse_mode": "html"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message_id": 981 })))
        .expect(1)
        .mount(&server)
        .await;

    let sender = WebhookSender::new(
        &server.uri(),
        Some(Secret::new("bot-token")),
        ClientConfig::default(),
    )
    .unwrap();
    let options = SendOptions { silent: true, parse_mode: Some("html".to_string()) };
    let receipt = sender.send("chan-1", "hello", &options).await.unwrap();

    assert_eq!(receipt.message_ref.as_deref(), Some("981"));
}

#[tokio::test]
async fn send_tolerates_non_json_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let sender = WebhookSender::new(&server.uri(), None, ClientConfig::default()).unwrap();
    let receipt = sender.send("chan-1", "hello", &SendOptions::default()).await.unwrap();

    assert_eq!(receipt.message_ref, None);
}

#[tokio::test]
async fn send_429_takes_hint_from_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "parameters": { "retry_after": 5 }
        })))
        .mount(&server)
        .await;

    let sender = WebhookSender::new(&server.uri(), None, ClientConfig::default()).unwrap();
    let error = sender.send("chan-1", "hello", &SendOptions::default()).await.unwrap_err();

    assert!(error.is_throttle());
    assert_eq!(error.retry_after(), Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn send_403_is_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_string("bot was kicked"))
        .mount(&server)
        .await;

    let sender = WebhookSender::new(&server.uri(), None, ClientConfig::default()).unwrap();
    let error = sender.send("chan-1", "hello", &SendOptions::default()).await.unwrap_err();

    assert!(error.is_auth());
}

#[test]
fn invalid_base_url_is_rejected() {
    assert!(HttpFeedSource::new("not a url", ClientConfig::default()).is_err());
    assert!(WebhookSender::new("::", None, ClientConfig::default()).is_err());
}
