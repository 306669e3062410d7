//! Core domain models, error taxonomy and collaborator ports.
//!
//! Every other feedrelay crate builds on the types defined here. The
//! reliability layer never talks to a concrete upstream, store or sender;
//! it talks to the traits in [`ports`], and every failure that crosses one
//! of those traits has already been normalized into a [`CallError`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod memory;
pub mod models;
pub mod ports;
pub mod time;

pub use error::{CallError, FailureKind};
pub use memory::{MemoryCircuitStore, MemorySeenStore};
pub use models::{
    CircuitSnapshot, CircuitState, Credential, FetchPage, FetchQuery, ItemId, MessageId, NewMessage,
    QueuedMessage, Scope, Secret, SendOptions, SendReceipt, Topic, WorkItem,
};
pub use ports::{
    CircuitStateStore, DownstreamSender, PlainRenderer, Renderer, SeenStore, UpstreamSource,
};
pub use time::{Clock, RealClock, TestClock};

/// Circuit category guarding upstream fetches.
pub const UPSTREAM_FETCH: &str = "upstream-fetch";

/// Circuit category guarding downstream sends.
pub const DOWNSTREAM_SEND: &str = "downstream-send";
