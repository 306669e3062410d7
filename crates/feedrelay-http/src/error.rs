//! Construction errors for the HTTP clients.
//!
//! Call failures are never reported here; they are normalized into
//! [`feedrelay_core::CallError`] by [`crate::classify`].

use thiserror::Error;

/// Result type alias for client construction.
pub type Result<T> = std::result::Result<T, HttpError>;

/// Errors building an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The configured base URL does not parse.
    #[error("invalid base url '{url}': {message}")]
    InvalidUrl {
        /// URL as configured
        url: String,
        /// Parser message
        message: String,
    },

    /// reqwest rejected the client settings.
    #[error("invalid client configuration: {message}")]
    Configuration {
        /// Builder message
        message: String,
    },
}

impl HttpError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}
