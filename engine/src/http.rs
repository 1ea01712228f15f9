//! HTTP transport implementation.
//!
//! JSON over `POST {base}/sync/pull` and `POST {base}/sync/push` with a
//! bearer token. Failures are mapped onto [`SyncError`] so the retry
//! scheduler can tell transient from terminal ones.

use crate::{
    error::SyncError,
    protocol::{PullRequest, PullResponse, PushRequest, PushResponse, PULL_PATH, PUSH_PATH},
    transport::{SyncTransport, TransportResult},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP-based sync transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with its own client and a request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Use an existing client (shared connection pool, custom TLS, ...).
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<Req, Res>(&self, path: &str, request: &Req, token: &str) -> TransportResult<Res>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::from_status(status.as_u16(), body));
        }

        let body = response.bytes().await.map_err(classify)?;
        decode_body(status.as_u16(), &body)
    }
}

/// Decode a success body. An undecodable one (a captive portal page, a
/// truncated reply) is the server's fault and may be retried.
fn decode_body<Res: DeserializeOwned>(status: u16, body: &[u8]) -> TransportResult<Res> {
    serde_json::from_slice(body).map_err(|e| SyncError::Server {
        status,
        message: format!("malformed response: {e}"),
    })
}

fn classify(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout
    } else if let Some(status) = err.status() {
        SyncError::from_status(status.as_u16(), err.to_string())
    } else {
        SyncError::Network(err.to_string())
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn pull(&self, request: &PullRequest, token: &str) -> TransportResult<PullResponse> {
        self.post_json(PULL_PATH, request, token).await
    }

    async fn push(&self, request: &PushRequest, token: &str) -> TransportResult<PushResponse> {
        self.post_json(PUSH_PATH, request, token).await
    }
}
