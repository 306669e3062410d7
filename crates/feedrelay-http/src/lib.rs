//! HTTP boundary for feedrelay.
//!
//! Two clients sit on the edge of the system:
//!
//! - [`HttpFeedSource`] fetches pages of items from the upstream search API.
//! - [`WebhookSender`] posts rendered messages to the downstream channel.
//!
//! Both turn every non-success outcome into a [`feedrelay_core::CallError`]
//! through [`classify`], so the breaker, rotator and queue never look at a
//! status code.
//!
//! ```no_run
//! use feedrelay_http::{ClientConfig, HttpFeedSource, WebhookSender};
//!
//! # fn example() -> feedrelay_http::Result<()> {
//! let source = HttpFeedSource::new("https://feed.example/api", ClientConfig::default())?;
//! let sender = WebhookSender::new("https://chat.example/bot", None, ClientConfig::default())?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod classify;
pub mod config;
pub mod error;
pub mod sender;
pub mod source;

pub use config::ClientConfig;
pub use error::{HttpError, Result};
pub use sender::WebhookSender;
pub use source::HttpFeedSource;
