//! HTTP feed fetching and incident stores for TIX.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

mod importer;
mod store;

pub use importer::ImporterStore;
pub use store::{
    CoordinateAudit, IncidentStore, MemoryIncidentStore, SqliteIncidentStore, StoreError,
    UpsertStats,
};

pub const CRATE_NAME: &str = "tix-storage";

const SNIPPET_CHARS: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Body that came back but could not be decoded as JSON.
#[derive(Debug, Error)]
#[error("Failed to parse JSON. The server returned an unexpected format. Response snippet: {snippet}...")]
pub struct ParseError {
    pub url: String,
    pub snippet: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP error {status}. Response: {body}")]
    Status { status: u16, url: String, body: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Operator-facing hint for the statuses that usually mean misconfiguration.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status()? {
            401 | 403 => Some("This is an authentication error; verify the API key configured for this feed."),
            404 => Some("This is a 'Not Found' error; the feed URL is likely incorrect."),
            _ => None,
        }
    }
}

/// First `SNIPPET_CHARS` characters of a body, lossily decoded.
pub fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(SNIPPET_CHARS).collect()
}

/// Seam between the sync orchestrator and the network.
#[async_trait]
pub trait RawFetcher: Send + Sync {
    async fn fetch_json(&self, source_name: &str, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn per_source_semaphore(&self, source_name: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, source_name: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_name).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source = source_name, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|source| FetchError::Transport {
                            url: final_url.clone(),
                            source,
                        })?
                        .to_vec();

                    if status.is_success() {
                        return Ok(FetchedResponse {
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    warn!(%status, "feed returned non-success status");
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: final_url,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl RawFetcher for HttpFetcher {
    async fn fetch_json(&self, source_name: &str, url: &str) -> Result<JsonValue, FetchError> {
        let response = self.fetch_bytes(source_name, url).await?;
        decode_json(&response.final_url, &response.body)
    }
}

pub fn decode_json(url: &str, body: &[u8]) -> Result<JsonValue, FetchError> {
    serde_json::from_slice(body).map_err(|source| {
        FetchError::Parse(ParseError {
            url: url.to_string(),
            snippet: body_snippet(body),
            source,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn html_body_becomes_parse_error_with_snippet() {
        let body = format!("<html>{}</html>", "x".repeat(400));
        let err = decode_json("https://feeds.example/tx", body.as_bytes()).unwrap_err();
        let FetchError::Parse(parse) = &err else {
            panic!("expected parse error, got {err:?}");
        };
        assert_eq!(parse.snippet.chars().count(), 150);
        assert!(parse.snippet.starts_with("<html>"));
        assert!(err.to_string().contains("Response snippet: <html>xxx"));
    }

    #[test]
    fn status_errors_carry_body_and_hint() {
        let err = FetchError::Status {
            status: 401,
            url: "https://feeds.example/ohgo".into(),
            body: "{\"error\":\"bad key\"}".into(),
        };
        assert_eq!(err.to_string(), "HTTP error 401. Response: {\"error\":\"bad key\"}");
        assert!(err.hint().unwrap().contains("authentication"));

        let not_found = FetchError::Status {
            status: 404,
            url: String::new(),
            body: String::new(),
        };
        assert!(not_found.hint().unwrap().contains("Not Found"));
    }

    #[test]
    fn valid_json_decodes() {
        let value = decode_json("u", br#"[{"id": 1}]"#).unwrap();
        assert_eq!(value[0]["id"], 1);
    }
}
