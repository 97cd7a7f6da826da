//! Outbound HTTP for source discovery and remote scoring: bounded concurrency,
//! retry classification, capped exponential backoff, optional per-minute rate limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

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

/// Same as [`classify_status`] for a bare status code; unknown codes are not retried.
pub fn classify_status_code(status: u16) -> RetryDisposition {
    StatusCode::from_u16(status)
        .map(classify_status)
        .unwrap_or(RetryDisposition::NonRetryable)
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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
    /// Calls allowed per rolling minute across all requests; `None` disables limiting.
    pub calls_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            calls_per_minute: None,
        }
    }
}

/// Sliding one-minute window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    calls_per_window: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(calls: u32) -> Self {
        Self::with_window(calls, Duration::from_secs(60))
    }

    pub fn with_window(calls: u32, window: Duration) -> Self {
        Self {
            calls_per_window: calls.max(1) as usize,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut calls = self.calls.lock().await;
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                calls.pop_front();
            }

            if calls.len() < self.calls_per_window {
                calls.push_back(now);
                return;
            }

            let wait = calls
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            drop(calls);
            warn!(wait_ms = wait.as_millis() as u64, "rate limit reached; waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {message}")]
    Body { url: String, message: String },
    #[error("http client is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            limiter: config.calls_per_minute.map(RateLimiter::per_minute),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET with retries on 5xx / 429 / connection errors.
    pub async fn get_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url, method = "GET");
        self.send_with_retries(source_id, self.backoff.max_retries, || self.client.get(url))
            .instrument(span)
            .await
    }

    /// POST a JSON body; the reply body is returned as-is.
    pub async fn post_json_raw<B>(&self, source_id: &str, url: &str, body: &B) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("http_fetch", source_id, url, method = "POST");
        self.send_with_retries(source_id, self.backoff.max_retries, || self.client.post(url).json(body))
            .instrument(span)
            .await
    }

    /// POST a JSON body exactly once. For non-idempotent submissions whose caller
    /// owns the retry schedule.
    pub async fn post_json_once<B>(&self, source_id: &str, url: &str, body: &B) -> Result<FetchedResponse, FetchError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!("http_fetch", source_id, url, method = "POST", retries = 0);
        self.send_with_retries(source_id, 0, || self.client.post(url).json(body))
            .instrument(span)
            .await
    }

    /// POST a JSON body and decode a JSON reply.
    pub async fn post_json<B, R>(&self, source_id: &str, url: &str, body: &B) -> Result<R, FetchError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.post_json_raw(source_id, url, body).await?;
        serde_json::from_slice(&response.body).map_err(|e| FetchError::Body {
            url: response.final_url,
            message: e.to_string(),
        })
    }

    async fn send_with_retries<F>(
        &self,
        source_id: &str,
        max_retries: usize,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let retries_left = attempt < max_retries;

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
