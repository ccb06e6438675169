//! JSON API for triggering, cancelling and inspecting sync jobs.

use std::sync::Arc;

use adpulse_core::{DateRange, SyncKind};
use adpulse_storage::JobFilter;
use adpulse_sync::{SyncCoordinator, SyncError, SyncRequest, SyncTarget};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-web";

const MAX_JOB_PAGE: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/cancel", post(cancel_handler))
        .route("/api/sync/jobs", get(jobs_handler))
        .route("/api/sync/jobs/{id}", get(job_detail_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(coordinator: Arc<SyncCoordinator>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync api");
    axum::serve(listener, app(AppState::new(coordinator))).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SyncBody {
    account_id: String,
    #[serde(default)]
    sync_type: Option<SyncKind>,
    #[serde(default)]
    since: Option<NaiveDate>,
    #[serde(default)]
    until: Option<NaiveDate>,
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    job_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsQuery {
    account_id: Option<Uuid>,
    limit: Option<i64>,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn sync_error_response(err: SyncError) -> Response {
    match err {
        SyncError::Conflict {
            job_id,
            account_id,
            elapsed_seconds,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "a sync is already running",
                "running_job_id": job_id,
                "account_id": account_id,
                "elapsed_seconds": elapsed_seconds,
            })),
        )
            .into_response(),
        SyncError::UnknownAccount(_) | SyncError::NoActiveAccounts => {
            json_error(StatusCode::NOT_FOUND, err.to_string())
        }
        SyncError::Internal(err) => {
            error!(error = %format!("{err:#}"), "sync api request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Turn the body into a request. A lone bound is completed from the kind's
/// default window.
fn parse_sync_body(body: SyncBody, today: NaiveDate) -> Result<SyncRequest, String> {
    let target = if body.account_id.eq_ignore_ascii_case("all") {
        SyncTarget::AllActive
    } else {
        let id = Uuid::parse_str(body.account_id.trim())
            .map_err(|_| format!("account_id must be a uuid or \"all\", got `{}`", body.account_id))?;
        SyncTarget::One(id)
    };
    let kind = body.sync_type.unwrap_or(SyncKind::Manual);

    let range = match (body.since, body.until) {
        (None, None) => None,
        (since, until) => {
            let until = until.unwrap_or(today);
            let since = since.unwrap_or_else(|| {
                adpulse_sync::DateWindows::default().range_for(kind, until).since
            });
            Some(DateRange::new(since, until).ok_or("since must not be after until")?)
        }
    };

    Ok(SyncRequest {
        target,
        kind,
        range,
    })
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SyncBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let request = match parse_sync_body(body, Utc::now().date_naive()) {
        Ok(request) => request,
        Err(message) => return json_error(StatusCode::BAD_REQUEST, message),
    };
    match state.coordinator.start(request).await {
        Ok(results) => Json(json!({ "results": results })).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn cancel_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body: CancelBody = if body.iter().all(u8::is_ascii_whitespace) {
        CancelBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(body) => body,
            Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
        }
    };
    match state.coordinator.cancel(body.job_id).await {
        Ok(Some(job)) => Json(json!({ "cancelled": job })).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "no running sync job to cancel"),
        Err(err) => sync_error_response(err),
    }
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let filter = JobFilter {
        account_id: query.account_id,
        limit: query
            .limit
            .unwrap_or(JobFilter::default().limit)
            .clamp(1, MAX_JOB_PAGE),
    };
    match state.coordinator.list_jobs(&filter).await {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(err) => sync_error_response(err),
    }
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.coordinator.get_job(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, format!("sync job {id} not found")),
        Err(err) => sync_error_response(err),
    }
}
