use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tender_core::ErrorKind;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {message}")]
    Transport {
        url: String,
        message: String,
        disposition: RetryDisposition,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: url.to_string(),
                timeout: Duration::ZERO,
            };
        }
        Self::Transport {
            url: url.to_string(),
            message: err.to_string(),
            disposition: classify_reqwest_error(err),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transport { disposition, .. } => *disposition,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Timeout { .. } => RetryDisposition::Retryable,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::NavigationError
    }
}

/// Exponential backoff between attempts at one page.
///
/// `max_retries` counts total attempts, matching the `--max-retries` flag: a
/// budget of 3 means the page is requested at most three times.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn attempts(&self) -> usize {
        self.max_retries.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Retrieves the rendered content of one page. One call is one attempt.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Fetch with bounded retries; each attempt is capped at `policy.attempt_timeout`.
pub async fn fetch_with_retry<F>(
    fetcher: &F,
    url: &str,
    policy: &BackoffPolicy,
) -> Result<FetchedPage, FetchError>
where
    F: PageFetcher + ?Sized,
{
    let attempts = policy.attempts();
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                timeout: policy.attempt_timeout,
            }),
        };

        let err = match result {
            Ok(page) => return Ok(page),
            Err(err) => err,
        };
        attempt += 1;
        if err.disposition() == RetryDisposition::NonRetryable || attempt >= attempts {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        warn!(url, attempt, error = %err, delay_ms = delay.as_millis() as u64, "fetch failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 3,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    timeout: Duration,
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
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
                disposition: RetryDisposition::NonRetryable,
            })?;

        let resp = self.client.get(url).send().await.map_err(|err| {
            let mut mapped = FetchError::from_reqwest(url, &err);
            if let FetchError::Timeout { timeout, .. } = &mut mapped {
                *timeout = self.timeout;
            }
            mapped
        })?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|err| FetchError::from_reqwest(url, &err))?;
        debug!(url, bytes = body.len(), "fetched page");
        Ok(FetchedPage {
            url: url.to_string(),
            final_url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// Process-wide gate allowing each worker at most one navigation per interval.
#[derive(Debug)]
pub struct NavigationLimiter {
    interval: Duration,
    next_slot: Mutex<HashMap<usize, Instant>>,
}

impl NavigationLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn acquire(&self, worker: usize) {
        let wait = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots.get(&worker).copied().unwrap_or(now).max(now);
            slots.insert(worker, slot + self.interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyFetcher {
        calls: AtomicUsize,
        failures_before_success: usize,
        status: u16,
    }

    #[async_trait]
    impl PageFetcher for FlakyFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(FetchError::HttpStatus {
                    status: self.status,
                    url: url.to_string(),
                });
            }
            Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                body: "<html></html>".into(),
                fetched_at: Utc::now(),
            })
        }
    }

    fn fast_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            attempt_timeout: Duration::from_secs(1),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn retry_budget_counts_total_attempts() {
        let fetcher = FlakyFetcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 10,
            status: 503,
        };
        let err = fetch_with_retry(&fetcher, "https://example.test/a", &fast_policy(3))
            .await
            .expect_err("all attempts fail");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.kind(), ErrorKind::NavigationError);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let fetcher = FlakyFetcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 2,
            status: 502,
        };
        let page = fetch_with_retry(&fetcher, "https://example.test/b", &fast_policy(3))
            .await
            .expect("third attempt succeeds");
        assert_eq!(page.body, "<html></html>");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let fetcher = FlakyFetcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 10,
            status: 404,
        };
        let _ = fetch_with_retry(&fetcher, "https://example.test/c", &fast_policy(3)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_fetch_is_a_retryable_timeout() {
        struct Stalled;

        #[async_trait]
        impl PageFetcher for Stalled {
            async fn fetch(&self, _url: &str) -> Result<FetchedPage, FetchError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("attempt timeout fires first")
            }
        }

        let policy = BackoffPolicy {
            attempt_timeout: Duration::from_millis(10),
            ..fast_policy(2)
        };
        let err = fetch_with_retry(&Stalled, "https://example.test/slow", &policy)
            .await
            .expect_err("times out");
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn limiter_spaces_navigations_per_worker() {
        let limiter = NavigationLimiter::new(Duration::from_millis(40));
        let start = Instant::now();
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        assert!(start.elapsed() < Duration::from_millis(40));

        limiter.acquire(0).await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
