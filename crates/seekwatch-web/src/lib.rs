//! Axum JSON API over the scrape orchestrator.
//!
//! Thin request/response mapping only: input validation happens here before
//! a job is created, everything else is delegated to the engine. Expected
//! failures never surface as errors from this layer; clients poll job status
//! to discover them.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use seekwatch_core::{JobStatus, ScrapeRequest, WebhookRegistration};
use seekwatch_engine::{Orchestrator, ScrapeJob};
use serde::{Deserialize, Serialize};
use tracing::error;

pub const CRATE_NAME: &str = "seekwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize)]
struct ScrapeAccepted {
    job_id: String,
    status: JobStatus,
    message: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct JobsList {
    total: usize,
    jobs: Vec<ScrapeJob>,
}

#[derive(Debug, Deserialize, Default)]
struct ScrapeListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WebhookRegisterRequest {
    webhook_url: String,
    #[serde(default = "default_webhook_events")]
    events: Vec<String>,
    #[serde(default)]
    description: Option<String>,
}

fn default_webhook_events() -> Vec<String> {
    vec!["scrape.completed".to_string()]
}

#[derive(Debug, Serialize)]
struct WebhookList {
    total: usize,
    webhooks: Vec<WebhookRegistration>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RecordsPage {
    total: usize,
    page: usize,
    page_size: usize,
    jobs: Vec<seekwatch_core::JobRecord>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
    components: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(status: StatusCode, error: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error,
            message: message.into(),
        }),
    )
        .into_response()
}

pub fn app(state: AppState) -> Router {
    let api_keys = state.orchestrator.config().api.api_keys.clone();
    let state = Arc::new(state);
    Router::new()
        .route("/api/v1/scrape", post(submit_scrape).get(list_scrapes))
        .route("/api/v1/scrape/{job_id}", get(get_scrape))
        .route("/api/v1/webhooks", post(register_webhook).get(list_webhooks))
        .route("/api/v1/webhooks/{webhook_id}", delete(unregister_webhook))
        .route("/api/v1/jobs", get(list_records))
        .route("/api/v1/health", get(health))
        .layer(middleware::from_fn_with_state(api_keys, require_api_key))
        .with_state(state)
}

/// Serve forever on `bind`. Address and auth come from the orchestrator's
/// config.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Pass-through when no keys are configured; otherwise the `X-API-Key`
/// header must match one of them.
async fn require_api_key(
    State(api_keys): State<Vec<String>>,
    request: Request,
    next: Next,
) -> Response {
    if api_keys.is_empty() {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(key) if api_keys.iter().any(|k| k == key) => next.run(request).await,
        Some(_) => error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid API key"),
        None => error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing API key; include the X-API-Key header",
        ),
    }
}

async fn submit_scrape(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScrapeRequest>,
) -> Response {
    if request.max_pages == Some(0) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "max_pages must be a positive integer",
        );
    }
    if let Some(url) = &request.webhook_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "webhook_url must be an http(s) URL",
            );
        }
    }

    let job_id = state.orchestrator.submit(request);
    let Some(job) = state.orchestrator.get(&job_id) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "job vanished after submission",
        );
    };

    let orchestrator = state.orchestrator.clone();
    let spawned_id = job_id.clone();
    tokio::spawn(async move {
        orchestrator.run(&spawned_id).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(ScrapeAccepted {
            job_id,
            status: job.status,
            message: "scrape job queued".to_string(),
            created_at: job.created_at,
        }),
    )
        .into_response()
}

async fn get_scrape(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    match state.orchestrator.get(&job_id) {
        Some(job) => Json(job).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no scrape job with id {job_id}"),
        ),
    }
}

async fn list_scrapes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScrapeListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(message) => {
                return error_response(StatusCode::BAD_REQUEST, "validation_error", message)
            }
        },
        None => None,
    };
    let limit = query.limit.unwrap_or(100).max(1);
    let jobs = state.orchestrator.list(status, limit);
    Json(JobsList {
        total: jobs.len(),
        jobs,
    })
    .into_response()
}

async fn register_webhook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WebhookRegisterRequest>,
) -> Response {
    if !request.webhook_url.starts_with("http://") && !request.webhook_url.starts_with("https://") {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "webhook_url must be an http(s) URL",
        );
    }
    if request.events.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "events must not be empty",
        );
    }
    let registration = state.orchestrator.register_webhook(
        request.webhook_url,
        request.events,
        request.description,
    );
    (StatusCode::CREATED, Json(registration)).into_response()
}

async fn list_webhooks(State(state): State<Arc<AppState>>) -> Response {
    let webhooks = state.orchestrator.list_webhooks();
    Json(WebhookList {
        total: webhooks.len(),
        webhooks,
    })
    .into_response()
}

async fn unregister_webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
) -> Response {
    if state.orchestrator.unregister_webhook(&webhook_id) {
        Json(serde_json::json!({ "deleted": true, "webhook_id": webhook_id })).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no webhook with id {webhook_id}"),
        )
    }
}

async fn list_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let records = match state.orchestrator.store().load().await {
        Ok(records) => records,
        Err(err) => {
            error!(error = %err, "failed to load persisted records");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                err.to_string(),
            );
        }
    };

    let page_size = query.page_size.unwrap_or(50).max(1);
    let total = records.len();
    let total_pages = total.max(1).div_ceil(page_size);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let jobs = records
        .into_iter()
        .skip(start)
        .take(page_size)
        .collect::<Vec<_>>();

    Json(RecordsPage {
        total,
        page,
        page_size,
        jobs,
    })
    .into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let storage = match state.orchestrator.store().load().await {
        Ok(_) => "available",
        Err(_) => "unavailable",
    };
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
        components: serde_json::json!({
            "orchestrator": "ready",
            "storage": storage,
        }),
    })
    .into_response()
}
