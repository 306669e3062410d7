//! Scripted collaborators and fixtures for deterministic tests.
//!
//! The fakes replay a scripted sequence of outcomes and record every call
//! they receive, so tests can assert both on what the reliability layer did
//! and on when it did it. Call timestamps come from tokio's clock, which
//! makes them exact under `#[tokio::test(start_paused = true)]`.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod scripted;

pub use fixtures::{credentials, item, topic, ItemBuilder};
pub use scripted::{FetchCall, ScriptedSender, ScriptedSource, SendCall};
