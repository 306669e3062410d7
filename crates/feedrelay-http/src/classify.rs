//! Maps raw HTTP outcomes onto [`CallError`].
//!
//! This is the only place that decides whether a remote failure is a
//! throttle, an auth rejection or something else. Everything downstream of
//! the clients works on the normalized error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use feedrelay_core::CallError;
use http::{header::RETRY_AFTER, HeaderMap, StatusCode};

/// Longest body excerpt carried into an error message.
const BODY_EXCERPT_LIMIT: usize = 200;

/// Classifies a non-success response.
///
/// `429` is a throttle; its hint comes from `Retry-After`, falling back to
/// a `retry_after` field in a JSON body (top level or under `parameters`).
/// `401` and `403` are auth rejections. Anything else is a generic failure.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> CallError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            CallError::throttled(retry_after(headers).or_else(|| body_retry_after(body)))
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            CallError::auth_failed(format!("HTTP {}: {}", status.as_u16(), excerpt(body)))
        },
        _ => CallError::other(format!("HTTP {}: {}", status.as_u16(), excerpt(body))),
    }
}

/// Classifies a request that produced no response.
pub fn classify_transport(error: &reqwest::Error, timeout: Duration) -> CallError {
    if error.is_timeout() {
        return CallError::timeout(timeout);
    }
    if error.is_connect() {
        return CallError::other(format!("connection failed: {error}"));
    }
    CallError::other(format!("request failed: {error}"))
}

/// Reads `Retry-After` as delta seconds or an HTTP date.
///
/// Dates in the past yield a zero wait. Unparseable values yield `None`.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

fn body_retry_after(body: &str) -> Option<Duration> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("parameters").and_then(|p| p.get("retry_after")))
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_secs)
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    if body.len() <= BODY_EXCERPT_LIMIT {
        return body;
    }

    let mut end = BODY_EXCERPT_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers(retry_after: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(retry_after).unwrap());
        headers
    }

    #[test]
    fn too_many_requests_is_throttle_with_hint() {
        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers("120"), "");

        assert_eq!(error, CallError::throttled(Some(Duration::from_secs(120))));
    }

    #[test]
    fn throttle_hint_falls_back_to_body() {
        let body = r#"{"ok":false,"parameters":{"retry_after":5}}"#;

        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), body);

        assert_eq!(error.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn throttle_without_any_hint() {
        let error = classify_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "slow down");

        assert_eq!(error, CallError::throttled(None));
    }

    #[test]
    fn auth_statuses_are_auth_failures() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            assert!(classify_status(status, &HeaderMap::new(), "nope").is_auth());
        }
    }

    #[test]
    fn server_errors_are_generic() {
        let error = classify_status(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), "down");

        assert_eq!(error, CallError::other("HTTP 503: down"));
    }

    #[test]
    fn retry_after_accepts_http_dates() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let past = "Wed, 21 Oct 2015 07:28:00 GMT";

        let wait = retry_after(&headers(&future)).unwrap();

        assert!(wait > Duration::from_secs(80) && wait <= Duration::from_secs(90));
        assert_eq!(retry_after(&headers(past)), Some(Duration::ZERO));
        assert_eq!(retry_after(&headers("soon")), None);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(150);

        let cut = excerpt(&body);

        assert!(cut.len() <= BODY_EXCERPT_LIMIT);
        assert!(body.starts_with(cut));
    }
}
