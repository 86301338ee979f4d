//! Remote ADD sources.
//!
//! A [`Fetcher`] downloads one URL and classifies its failures;
//! [`fetch_with_retry`] adds the per-attempt timeout and bounded
//! exponential backoff on top.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kiln_core::config::FetchConfig;
use kiln_core::error::{KilnError, Result};

/// Why a single fetch attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Worth retrying: connect errors, timeouts, 5xx, 429
    Transient(String),
    /// Retrying cannot help
    Fatal(String),
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Transient(message) | FetchFailure::Fatal(message) => {
                f.write_str(message)
            }
        }
    }
}

/// Downloads remote content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure>;
}

/// HTTP(S) fetcher backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("HTTP {}", status);
            return Err(if is_transient_status(status) {
                FetchFailure::Transient(message)
            } else {
                FetchFailure::Fatal(message)
            });
        }

        let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.map_err(classify_error)?);
        }
        Ok(body)
    }
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

fn classify_error(err: reqwest::Error) -> FetchFailure {
    if err.is_timeout() || err.is_connect() || err.is_body() {
        FetchFailure::Transient(err.to_string())
    } else {
        FetchFailure::Fatal(err.to_string())
    }
}

/// Whether an ADD source names a remote URL.
pub fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// File name an un-extracted download is stored under.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Fetch `url`, retrying transient failures per `policy`.
pub async fn fetch_with_retry(
    fetcher: &dyn Fetcher,
    url: &str,
    policy: &FetchConfig,
) -> Result<Vec<u8>> {
    let attempt_timeout = Duration::from_secs(policy.attempt_timeout_secs.max(1));
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let failure = match tokio::time::timeout(attempt_timeout, fetcher.fetch(url)).await {
            Ok(Ok(bytes)) => {
                tracing::debug!(url, attempt, bytes = bytes.len(), "Fetched remote source");
                return Ok(bytes);
            }
            Ok(Err(failure)) => failure,
            Err(_) => FetchFailure::Transient(format!("timed out after {:?}", attempt_timeout)),
        };

        match failure {
            FetchFailure::Transient(message) if attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    url,
                    attempt,
                    max_attempts,
                    error = %message,
                    "Fetch failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            FetchFailure::Transient(message) => {
                return Err(KilnError::Fetch {
                    url: url.to_string(),
                    message: format!("{} (after {} attempts)", message, attempt),
                });
            }
            FetchFailure::Fatal(message) => {
                return Err(KilnError::Fetch {
                    url: url.to_string(),
                    message,
                });
            }
        }
    }
}
