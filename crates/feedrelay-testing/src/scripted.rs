//! Upstream and downstream fakes driven by scripted outcomes.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};

use async_trait::async_trait;
use feedrelay_core::{
    CallError, Credential, DownstreamSender, FetchPage, FetchQuery, Scope, SendOptions,
    SendReceipt, UpstreamSource, WorkItem,
};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// One call received by [`ScriptedSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCall {
    /// Destination passed to `send`
    pub destination: String,
    /// Payload passed to `send`
    pub payload: String,
    /// Whether the scripted outcome was a success
    pub succeeded: bool,
    /// Time of the call
    pub at: Instant,
}

/// Downstream sender replaying scripted outcomes.
///
/// Once the script is exhausted every send succeeds. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSender {
    script: Arc<Mutex<VecDeque<Result<(), CallError>>>>,
    calls: Arc<Mutex<Vec<SendCall>>>,
}

impl ScriptedSender {
    /// Creates a sender that succeeds until scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next unscripted send.
    pub fn push_failure(&self, error: CallError) {
        lock(&self.script).push_back(Err(error));
    }

    /// Queues an explicit success.
    pub fn push_success(&self) {
        lock(&self.script).push_back(Ok(()));
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<SendCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls received, successful or not.
    pub fn attempt_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Number of successful sends.
    pub fn sent_count(&self) -> usize {
        lock(&self.calls).iter().filter(|call| call.succeeded).count()
    }

    /// Payloads of successful sends, in order.
    pub fn delivered_payloads(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.succeeded)
            .map(|call| call.payload.clone())
            .collect()
    }
}

#[async_trait]
impl DownstreamSender for ScriptedSender {
    async fn send(
        &self,
        destination: &str,
        payload: &str,
        _options: &SendOptions,
    ) -> Result<SendReceipt, CallError> {
        let outcome = lock(&self.script).pop_front().unwrap_or(Ok(()));
        lock(&self.calls).push(SendCall {
            destination: destination.to_string(),
            payload: payload.to_string(),
            succeeded: outcome.is_ok(),
            at: now(),
        });

        outcome.map(|()| SendReceipt { message_ref: Some(Uuid::new_v4().to_string()) })
    }
}

/// One call received by [`ScriptedSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    /// Scope polled
    pub scope: Scope,
    /// Cursor passed in
    pub cursor: Option<String>,
    /// Signature of the credential used
    pub credential: String,
    /// Time of the call
    pub at: Instant,
}

/// Upstream source replaying scripted pages and failures.
///
/// Once the script is exhausted every fetch returns an empty page. Clones
/// share state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<VecDeque<Result<FetchPage, CallError>>>>,
    calls: Arc<Mutex<Vec<FetchCall>>>,
}

impl ScriptedSource {
    /// Creates a source with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a page of items with no follow-up cursor.
    pub fn push_items(&self, items: Vec<WorkItem>) {
        self.push_page(FetchPage { items, cursor: None });
    }

    /// Queues a full page.
    pub fn push_page(&self, page: FetchPage) {
        lock(&self.script).push_back(Ok(page));
    }

    /// Queues a failure.
    pub fn push_failure(&self, error: CallError) {
        lock(&self.script).push_back(Err(error));
    }

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<FetchCall> {
        lock(&self.calls).clone()
    }

    /// Number of calls received.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl UpstreamSource for ScriptedSource {
    async fn fetch(
        &self,
        query: &FetchQuery,
        credential: &Credential,
    ) -> Result<FetchPage, CallError> {
        lock(&self.calls).push(FetchCall {
            scope: query.scope.clone(),
            cursor: query.cursor.clone(),
            credential: credential.signature(),
            at: now(),
        });

        lock(&self.script).pop_front().unwrap_or_else(|| Ok(FetchPage::default()))
    }
}
