//! Transport layer abstraction for sync operations.
//!
//! The coordinator only needs two calls, pull and push, each carrying the
//! caller's bearer token. [`HttpTransport`](crate::HttpTransport) talks to a
//! real endpoint; [`MockTransport`] replays scripted responses for tests.

use crate::{
    error::SyncError,
    protocol::{PullRequest, PullResponse, PushRequest, PushResponse},
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result type of transport calls.
pub type TransportResult<T> = std::result::Result<T, SyncError>;

/// Network access to the remote sync endpoint.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull(&self, request: &PullRequest, token: &str) -> TransportResult<PullResponse>;

    async fn push(&self, request: &PushRequest, token: &str) -> TransportResult<PushResponse>;
}

/// Supplies the bearer token attached to every call.
///
/// Refreshing expired tokens is the provider's job; the engine only notices
/// when the token it was handed changes.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A token that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// A scripted transport for testing.
///
/// Responses are consumed in order; once a script runs dry, pulls return no
/// changes and pushes accept everything. Every request is recorded.
#[derive(Debug, Default)]
pub struct MockTransport {
    pull_script: Mutex<VecDeque<TransportResult<PullResponse>>>,
    push_script: Mutex<VecDeque<TransportResult<PushResponse>>>,
    pulls: Mutex<Vec<PullRequest>>,
    pushes: Mutex<Vec<PushRequest>>,
    tokens: Mutex<Vec<String>>,
    clock: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next unscripted pull.
    pub fn script_pull(&self, result: TransportResult<PullResponse>) {
        self.pull_script.lock().push_back(result);
    }

    /// Queue the result of the next unscripted push.
    pub fn script_push(&self, result: TransportResult<PushResponse>) {
        self.push_script.lock().push_back(result);
    }

    /// Pull requests received so far.
    pub fn pulls(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Push requests received so far.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Tokens presented, one per call.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.tokens.lock().len()
    }

    fn next_timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn pull(&self, request: &PullRequest, token: &str) -> TransportResult<PullResponse> {
        self.tokens.lock().push(token.to_string());
        self.pulls.lock().push(request.clone());
        let scripted = self.pull_script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PullResponse {
                timestamp: self.next_timestamp(),
                ..PullResponse::default()
            })
        })
    }

    async fn push(&self, request: &PushRequest, token: &str) -> TransportResult<PushResponse> {
        self.tokens.lock().push(token.to_string());
        self.pushes.lock().push(request.clone());
        let scripted = self.push_script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PushResponse {
                timestamp: Some(self.next_timestamp()),
                ..PushResponse::default()
            })
        })
    }
}
