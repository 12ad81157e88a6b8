//! Single-attempt network fetches.
//!
//! A [`Transport`] performs exactly one round trip per call and reports failures as
//! values. Retrying is layered on top by [`crate::retry`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{HeaderMap, RANGE};
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{DownloadError, FailureKind, FetchFailure};

/// Outcome of a fetch: the body bytes, or a typed failure.
pub type FetchResult = Result<Bytes, FetchFailure>;

/// A contiguous byte range of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Value for an HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        let last = self.end().saturating_sub(1).max(self.offset);
        format!("bytes={}-{}", self.offset, last)
    }
}

/// One fetch attempt. Built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub range: Option<ByteRange>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, headers: HeaderMap, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout,
            range: None,
        }
    }

    /// Request using the configured headers and per-attempt timeout.
    pub fn from_config(url: impl Into<String>, config: &EngineConfig) -> Self {
        Self::new(url, config.default_headers.clone(), config.timeout)
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a single attempt. Never retries.
    async fn fetch(&self, request: &FetchRequest) -> FetchResult;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| DownloadError::Configuration {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn classify_send_error(e: &reqwest::Error) -> FailureKind {
    if e.is_timeout() {
        FailureKind::TimedOut
    } else if e.is_builder() {
        FailureKind::InvalidRequest
    } else if e.is_body() || e.is_decode() {
        FailureKind::BodyRead
    } else {
        FailureKind::ConnectionFailed
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let mut builder = self
            .client
            .get(request.url.as_str())
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchFailure::new(classify_send_error(&e), e.to_string()))?;

        let status = response.status();
        trace!(url = %request.url, status = status.as_u16(), "received response");
        if !status.is_success() {
            return Err(FetchFailure::new(
                FailureKind::HttpStatus(status.as_u16()),
                format!("unexpected status {status} for {}", request.url),
            ));
        }

        response.bytes().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::TimedOut
            } else {
                FailureKind::BodyRead
            };
            FetchFailure::new(kind, e.to_string())
        })
    }
}
