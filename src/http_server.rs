//! HTTP server implementation using Axum.

use crate::errors::PirunError;
use crate::files::FileEntry;
use crate::log_reader::DEFAULT_TAIL_KB;
use crate::state::{AppState, RunRegistry, RunState};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::interval;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// How often finished runs are swept when a retention is configured.
const RETENTION_SWEEP_SECS: u64 = 60;

/// HTTP-level settings taken from the project config.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
    pub run_retention: Option<Duration>,
}

// Request/Response types
#[derive(Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
struct RunIdQuery {
    run_id: Option<String>,
}

#[derive(Deserialize)]
struct LogQuery {
    run_id: Option<String>,
    tail_kb: Option<u64>,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    content: String,
}

#[derive(Deserialize)]
struct RunRequest {
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Serialize)]
struct ListResponse {
    entries: Vec<FileEntry>,
}

#[derive(Serialize)]
struct FileResponse {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct MutationResponse {
    path: String,
    success: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    run_id: String,
    state: RunState,
    started_at: i64,
    ended_at: Option<i64>,
    exit_code: Option<i32>,
}

#[derive(Serialize)]
struct LogResponse {
    run_id: String,
    log: String,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn missing_param(name: &str) -> Self {
        Self::BadRequest(format!("Missing '{name}' parameter"))
    }
}

impl From<PirunError> for ApiError {
    fn from(err: PirunError) -> Self {
        match err {
            PirunError::NotFound(_) => Self::NotFound(err.to_string()),
            PirunError::PathEscape(_)
            | PirunError::NotAFile(_)
            | PirunError::NotADirectory(_)
            | PirunError::IsADirectory(_)
            | PirunError::InvalidScript(_)
            | PirunError::Decode(_) => Self::BadRequest(err.to_string()),
            other => {
                error!(error = %other, "internal error");
                Self::Internal(format!("Internal error: {other}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the router for the given state.
pub fn build_router(state: AppState, options: &ServerOptions) -> Router {
    Router::new()
        // Files
        .route("/api/files", get(list_files))
        .route(
            "/api/file",
            get(read_file).put(write_file).delete(delete_file),
        )
        // Runs
        .route("/api/run", post(start_run))
        .route("/api/run/status", get(run_status))
        .route("/api/run/log", get(run_log))
        // Health check
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(TimeoutLayer::new(options.request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on `addr` with the provided state.
pub async fn run_server(addr: &str, state: AppState, options: ServerOptions) -> anyhow::Result<()> {
    if let Some(retention) = options.run_retention {
        let registry = state.runs.registry().clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(RETENTION_SWEEP_SECS));
            loop {
                interval.tick().await;
                evict_expired_runs(&registry, retention).await;
            }
        });
    }

    let app = build_router(state, &options);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::errors::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<ListResponse> {
    let path = q.path.unwrap_or_default();
    let files = state.files.clone();
    let entries = blocking(move || files.list(&path)).await?;
    Ok(Json(ListResponse { entries }))
}

async fn read_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<FileResponse> {
    let path = required(q.path, "path")?;
    let files = state.files.clone();
    let content = blocking({
        let path = path.clone();
        move || files.read(&path)
    })
    .await?;
    Ok(Json(FileResponse { path, content }))
}

async fn write_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
    body: Bytes,
) -> ApiResult<MutationResponse> {
    let path = required(q.path, "path")?;
    let req: WriteFileRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Missing 'content' in request body".to_string()))?;

    let files = state.files.clone();
    blocking({
        let path = path.clone();
        move || files.write(&path, &req.content)
    })
    .await?;
    Ok(Json(MutationResponse { path, success: true }))
}

async fn delete_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> ApiResult<MutationResponse> {
    let path = required(q.path, "path")?;
    let files = state.files.clone();
    blocking({
        let path = path.clone();
        move || files.delete(&path)
    })
    .await?;
    Ok(Json(MutationResponse { path, success: true }))
}

async fn start_run(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<crate::runner::RunTicket> {
    let req: RunRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Missing 'path' in request body".to_string()))?;

    info!("POST /api/run - script: {} args: {:?}", req.path, req.args);
    // A missing script is the client's mistake here, not a missing resource.
    let ticket = state
        .runs
        .start(&req.path, req.args)
        .await
        .map_err(|e| match e {
            PirunError::NotFound(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::from(other),
        })?;
    Ok(Json(ticket))
}

async fn run_status(
    State(state): State<AppState>,
    Query(q): Query<RunIdQuery>,
) -> ApiResult<StatusResponse> {
    let run_id = required(q.run_id, "run_id")?;
    let record = state.runs.status(&run_id).await?;
    Ok(Json(StatusResponse {
        run_id: record.run_id,
        state: record.state,
        started_at: record.started_at.timestamp(),
        ended_at: record.ended_at.map(|t| t.timestamp()),
        exit_code: record.exit_code,
    }))
}

async fn run_log(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> ApiResult<LogResponse> {
    let run_id = required(q.run_id, "run_id")?;
    let tail_kb = q.tail_kb.unwrap_or(DEFAULT_TAIL_KB);
    let log = state.logs.tail(&run_id, tail_kb).await?;
    Ok(Json(LogResponse { run_id, log }))
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::missing_param(name)),
    }
}

async fn evict_expired_runs(registry: &RunRegistry, retention: Duration) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return;
    };
    let evicted = registry.evict_finished_before(Utc::now() - retention).await;
    if evicted > 0 {
        info!("Evicted {} finished runs past retention", evicted);
    }
}
