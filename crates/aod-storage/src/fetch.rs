//! Shared HTTP client for source executors, with global and per-platform concurrency
//! limits and exponential backoff on retryable failures.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

/// How a failed source request should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Throttling, upstream hiccups and dropped connections; retried with backoff.
    Transient,
    /// The source no longer knows the target (delisted game, removed title).
    Gone,
    /// Anything else, e.g. a rejected API key or a malformed request.
    Permanent,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FailureClass::Gone,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FailureClass::Transient,
        StatusCode::NOT_IMPLEMENTED | StatusCode::HTTP_VERSION_NOT_SUPPORTED => {
            FailureClass::Permanent
        }
        s if s.is_server_error() => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FailureClass {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Seconds from a `Retry-After` header; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Exponential backoff with a bounded spread so executors hitting one API do not retry in step.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay (0.0..=1.0) spread around the nominal value.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (0-based) of a request for `url`.
    pub fn delay_for_attempt(&self, attempt: usize, url: &str) -> Duration {
        let factor = u32::try_from(attempt)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let nominal = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return nominal;
        }

        let mut hasher = DefaultHasher::new();
        (url, attempt).hash(&mut hasher);
        let unit = (hasher.finish() % 1000) as f64 / 1000.0;
        let scale = 1.0 + spread * (unit * 2.0 - 1.0);
        nominal.mul_f64(scale).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_platform_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some("aod-bot/0.1".to_string()),
            global_concurrency: 16,
            per_platform_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("target not found at {url} (http {status})")]
    Gone { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_platform_limit: usize,
    per_platform: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
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
            per_platform_limit: config.per_platform_concurrency.max(1),
            per_platform: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn platform_semaphore(&self, platform: &str) -> Arc<Semaphore> {
        let mut map = self.per_platform.lock().await;
        map.entry(platform.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_platform_limit)))
            .clone()
    }

    /// GETs `url` and decodes the body as JSON.
    pub async fn fetch_json(&self, platform: &str, url: &str) -> Result<JsonValue, FetchError> {
        let body = self.fetch_bytes(platform, url).await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    pub async fn fetch_bytes(&self, platform: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_platform = self.platform_semaphore(platform).await;
        let _platform = per_platform.acquire().await.map_err(|_| FetchError::Closed)?;

        self.get_with_backoff(url)
            .instrument(info_span!("http_fetch", platform, url))
            .await
    }

    async fn get_with_backoff(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            let (err, server_hint) = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(%status, "fetched");
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    let final_url = resp.url().to_string();
                    match classify_status(status) {
                        FailureClass::Gone => {
                            return Err(FetchError::Gone {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        FailureClass::Permanent => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        FailureClass::Transient => (
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            },
                            retry_after(resp.headers()),
                        ),
                    }
                }
                Err(err) => match classify_reqwest_error(&err) {
                    FailureClass::Transient => (FetchError::Request(err), None),
                    FailureClass::Gone | FailureClass::Permanent => {
                        return Err(FetchError::Request(err))
                    }
                },
            };

            if attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let backoff = self.backoff.delay_for_attempt(attempt, url);
            let delay = server_hint
                .map_or(backoff, |hint| hint.max(backoff))
                .min(self.backoff.max_delay);
            warn!(attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn backoff_doubles_and_caps_without_jitter() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };

        let url = "https://api.themoviedb.org/3/movie/603";
        assert_eq!(policy.delay_for_attempt(0, url), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1, url), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2, url), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40, url), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_its_band_and_varies_by_target() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (0..20)
            .map(|appid| {
                policy.delay_for_attempt(
                    1,
                    &format!("https://store.steampowered.com/api/appdetails?appids={appid}"),
                )
            })
            .collect();

        let nominal = policy.base_delay * 2;
        for delay in &delays {
            assert!(*delay >= nominal.mul_f64(0.75), "{delay:?} below band");
            assert!(*delay <= nominal.mul_f64(1.25), "{delay:?} above band");
        }
        assert!(delays.iter().any(|d| *d != delays[0]));
    }

    #[test]
    fn source_statuses_are_classified() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::Gone);
        assert_eq!(classify_status(StatusCode::GONE), FailureClass::Gone);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), FailureClass::Permanent);
        assert_eq!(classify_status(StatusCode::NOT_IMPLEMENTED), FailureClass::Permanent);
    }

    #[test]
    fn retry_after_reads_delay_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
