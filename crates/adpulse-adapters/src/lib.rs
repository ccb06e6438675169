//! Ads platform API client: typed decode, cursor pagination, rate-limit backoff
//! and per-call accounting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adpulse_core::{SoftError, SyncPhase};
use adpulse_storage::{HttpClientConfig, HttpFetcher, RetryDisposition, RetryError, RetryPolicy};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod graph;
pub mod metrics;

pub use graph::{
    decode_page, AdRow, GraphEndpoints, GraphError, GraphPage, InsightRow, InsightsWindow,
};
pub use metrics::parse_insight;

pub const CRATE_NAME: &str = "adpulse-adapters";

/// Shared API call counter; every attempt counts, retries included.
#[derive(Debug, Clone, Default)]
pub struct CallTracker(Arc<AtomicI64>);

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Whole-job wall-clock budget, checked between units of work.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Cancelled,
}

/// Per-job state threaded through every fetch: call accounting, deadline, cancellation.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub calls: CallTracker,
    pub deadline: Deadline,
    pub cancel: CancellationToken,
}

impl FetchContext {
    pub fn new(budget: Duration, cancel: CancellationToken) -> Self {
        Self {
            calls: CallTracker::new(),
            deadline: Deadline::start(budget),
            cancel,
        }
    }

    /// Cancellation wins over the deadline when both apply.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.deadline.is_expired() {
            Some(StopReason::Deadline)
        } else {
            None
        }
    }

    pub fn timeout_notice(&self, phase: SyncPhase, what: &str) -> SoftError {
        SoftError::new(
            phase,
            format!(
                "skipped due to timeout: job budget of {}s exhausted before {what}",
                self.deadline.budget().as_secs()
            ),
        )
    }

    /// Sleep unless cancelled first. Returns false when cancelled.
    pub async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Items collected across pages plus any soft errors that cut the walk short.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub pages: usize,
    pub errors: Vec<SoftError>,
    pub stopped: Option<StopReason>,
}

impl<T> Default for Paged<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pages: 0,
            errors: Vec::new(),
            stopped: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphClientConfig {
    pub http: HttpClientConfig,
    pub rate_limit: RetryPolicy,
    pub page_delay: Duration,
}

impl Default for GraphClientConfig {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            rate_limit: RetryPolicy::linear(Duration::from_secs(30), 2),
            page_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    http: HttpFetcher,
    rate_limit: RetryPolicy,
    page_delay: Duration,
}

impl GraphClient {
    pub fn new(config: GraphClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            rate_limit: config.rate_limit,
            page_delay: config.page_delay,
        })
    }

    /// Fetch and decode one page, retrying only on rate-limit errors.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        url: &str,
        token: &str,
        ctx: &FetchContext,
    ) -> Result<GraphPage<T>, GraphError> {
        let attempt = |_retry: usize| async move {
            ctx.calls.record();
            match self.http.get_with_bearer(url, token).await {
                Ok(resp) => decode_page::<T>(resp.status, &resp.body),
                Err(err) => Err(GraphError::from(err)),
            }
        };
        let classify = |err: &GraphError| {
            if err.is_rate_limited() {
                warn!(error = %err, "rate limited by ads api");
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        };
        match self.rate_limit.run(&ctx.cancel, attempt, classify).await {
            Ok(page) => Ok(page),
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { retries, last }) => Err(GraphError::RateLimitExhausted {
                retries,
                message: last.to_string(),
            }),
            Err(RetryError::Cancelled) => Err(GraphError::Cancelled),
        }
    }

    /// Follow `paging.next` from `first_url` until exhausted, stopped, or failed.
    ///
    /// Failures never propagate: they land in `Paged::errors` and the items
    /// gathered so far are kept.
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        first_url: &str,
        token: &str,
        ctx: &FetchContext,
        phase: SyncPhase,
        label: &str,
    ) -> Paged<T> {
        let mut out = Paged::default();
        let mut next = Some(first_url.to_string());

        while let Some(url) = next.take() {
            if let Some(reason) = ctx.stop_reason() {
                if reason == StopReason::Deadline {
                    out.errors.push(ctx.timeout_notice(
                        phase,
                        &format!("{label} page {}", out.pages + 1),
                    ));
                }
                out.stopped = Some(reason);
                break;
            }

            match self.fetch_page::<T>(&url, token, ctx).await {
                Ok(page) => {
                    out.pages += 1;
                    next = page.next_url().map(str::to_string);
                    debug!(label, page = out.pages, rows = page.data.len(), "fetched page");
                    out.items.extend(page.data);
                }
                Err(GraphError::Cancelled) => {
                    out.stopped = Some(StopReason::Cancelled);
                    break;
                }
                Err(err) => {
                    let message = match &err {
                        GraphError::Timeout(_) => {
                            format!("skipped: {label} page {} request timed out", out.pages + 1)
                        }
                        _ => format!("{label} page {} failed: {err}", out.pages + 1),
                    };
                    warn!(label, error = %err, "abandoning pagination");
                    out.errors.push(SoftError::new(phase, message));
                    break;
                }
            }

            if next.is_some() && !ctx.pause(self.page_delay).await {
                out.stopped = Some(StopReason::Cancelled);
                break;
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    #[derive(Clone)]
    struct MockState {
        base: String,
        hits: Arc<AtomicUsize>,
        throttle_first: usize,
    }

    async fn ads_handler(
        State(state): State<MockState>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        if hit < state.throttle_first {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "User request limit reached", "code": 17}})),
            )
                .into_response();
        }
        match params.get("after").map(String::as_str) {
            None => Json(json!({
                "data": [{"id": "1", "name": "one"}, {"id": "2", "name": "two"}],
                "paging": {"next": format!("{}/act_1/ads?after=p2", state.base)}
            }))
            .into_response(),
            Some("p2") => Json(json!({
                "data": [{"id": "3", "name": "three"}],
                "paging": {"next": format!("{}/act_1/ads?after=broken", state.base)}
            }))
            .into_response(),
            Some(_) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "Invalid cursor", "code": 100}})),
            )
                .into_response(),
        }
    }

    async fn spawn_mock(throttle_first: usize) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let state = MockState {
            base: base.clone(),
            hits: hits.clone(),
            throttle_first,
        };
        let app = Router::new()
            .route("/act_1/ads", get(ads_handler))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (base, hits)
    }

    fn client() -> GraphClient {
        GraphClient::new(GraphClientConfig {
            http: HttpClientConfig {
                timeout: Duration::from_secs(5),
                user_agent: None,
            },
            rate_limit: RetryPolicy::linear(Duration::from_millis(5), 2),
            page_delay: Duration::from_millis(1),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn pagination_keeps_items_before_a_hard_error() {
        let (base, _) = spawn_mock(0).await;
        let ctx = FetchContext::new(Duration::from_secs(60), CancellationToken::new());
        let paged: Paged<AdRow> = client()
            .fetch_all(&format!("{base}/act_1/ads"), "tok", &ctx, SyncPhase::Entities, "ads")
            .await;

        assert_eq!(paged.items.len(), 3);
        assert_eq!(paged.pages, 2);
        assert_eq!(paged.errors.len(), 1);
        assert!(paged.errors[0].message.contains("Invalid cursor"));
        assert_eq!(ctx.calls.count(), 3);
    }

    #[tokio::test]
    async fn rate_limit_retries_count_every_attempt() {
        let (base, hits) = spawn_mock(2).await;
        let ctx = FetchContext::new(Duration::from_secs(60), CancellationToken::new());
        let page: GraphPage<AdRow> = client()
            .fetch_page(&format!("{base}/act_1/ads"), "tok", &ctx)
            .await
            .unwrap();
        assert_eq!(page.data.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.calls.count(), 3);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_becomes_soft_error() {
        let (base, _) = spawn_mock(usize::MAX).await;
        let ctx = FetchContext::new(Duration::from_secs(60), CancellationToken::new());
        let paged: Paged<AdRow> = client()
            .fetch_all(&format!("{base}/act_1/ads"), "tok", &ctx, SyncPhase::Entities, "ads")
            .await;
        assert!(paged.items.is_empty());
        assert_eq!(paged.errors.len(), 1);
        assert!(paged.errors[0].message.contains("rate limited"));
        assert_eq!(ctx.calls.count(), 3);
    }

    #[tokio::test]
    async fn expired_deadline_issues_no_requests() {
        let (base, hits) = spawn_mock(0).await;
        let ctx = FetchContext::new(Duration::ZERO, CancellationToken::new());
        let paged: Paged<AdRow> = client()
            .fetch_all(&format!("{base}/act_1/ads"), "tok", &ctx, SyncPhase::Entities, "ads")
            .await;
        assert_eq!(paged.stopped, Some(StopReason::Deadline));
        assert!(paged.errors[0].message.starts_with("skipped due to timeout"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.calls.count(), 0);
    }

    #[tokio::test]
    async fn cancelled_context_stops_without_soft_error() {
        let (base, hits) = spawn_mock(0).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = FetchContext::new(Duration::from_secs(60), cancel);
        let paged: Paged<AdRow> = client()
            .fetch_all(&format!("{base}/act_1/ads"), "tok", &ctx, SyncPhase::Entities, "ads")
            .await;
        assert_eq!(paged.stopped, Some(StopReason::Cancelled));
        assert!(paged.errors.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
