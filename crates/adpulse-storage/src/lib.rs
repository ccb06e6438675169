//! HTTP transport, retry combinator and persistence for adpulse.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{
    BeginJob, CheckpointAck, JobFilter, MetricsUpdate, SyncStore, TagUpdate, TaggingCandidate,
};

pub const CRATE_NAME: &str = "adpulse-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Bounded retry with a linear `step * retry` backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub step: Duration,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {retries} retries: {last}")]
    Exhausted { retries: usize, last: E },
    #[error("{0}")]
    Fatal(E),
    #[error("cancelled while retrying")]
    Cancelled,
}

impl RetryPolicy {
    pub fn linear(step: Duration, max_retries: usize) -> Self {
        Self { max_retries, step }
    }

    /// Delay before the given 1-based retry.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        self.step.saturating_mul(retry.max(1) as u32)
    }

    /// Run `op` until it succeeds, hits a non-retryable error, or runs out of retries.
    ///
    /// `op` receives the zero-based attempt number. Backoff sleeps end early
    /// when `cancel` fires.
    pub async fn run<T, E, Op, Fut, C>(
        &self,
        cancel: &CancellationToken,
        mut op: Op,
        classify: C,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDisposition,
    {
        let mut retries = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            let err = match op(retries).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if classify(&err) == RetryDisposition::NonRetryable {
                return Err(RetryError::Fatal(err));
            }
            if retries >= self.max_retries {
                return Err(RetryError::Exhausted { retries, last: err });
            }
            retries += 1;
            let delay = self.delay_for_retry(retries);
            debug!(retries, delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(reqwest::Error),
    #[error("request failed: {0}")]
    Request(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Request(err)
        }
    }
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Single-attempt HTTP GET with a per-request timeout.
///
/// Non-success statuses are returned to the caller untouched; API error
/// envelopes travel in the body and are decoded upstream.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub async fn get_with_bearer(
        &self,
        url: &str,
        bearer: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %redact_query(url));
        async {
            let resp = self.client.get(url).bearer_auth(bearer).send().await?;
            let status = resp.status();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(FetchedResponse { status, body })
        }
        .instrument(span)
        .await
    }
}

/// Strip the query string so cursors and tokens stay out of logs.
pub fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(path, _)| path).unwrap_or(url)
}
