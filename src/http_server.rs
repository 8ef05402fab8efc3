//! Read-side HTTP API over the row store
//!
//! - GET /get?ts=<unix-seconds>&cluster=<name>[&pct=<percent>] - Rebuild a snapshot
//! - GET /snapshots?cluster=<name> - Snapshot timestamps, newest first
//! - GET /health - Liveness and uptime

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::db::Database;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// AppState
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    /// `None` when the row store is disabled.
    db: Option<Arc<Database>>,
    /// Trim fraction applied when a request carries no `pct`.
    remove_lowest_fraction: f64,
    start_time: Instant,
}

impl AppState {
    pub fn new(db: Option<Arc<Database>>, remove_lowest_fraction: f64) -> Self {
        Self {
            db,
            remove_lowest_fraction,
            start_time: Instant::now(),
        }
    }

    fn db(&self) -> Result<Arc<Database>, AppError> {
        self.db
            .clone()
            .ok_or_else(|| AppError(StatusCode::SERVICE_UNAVAILABLE, "row store is disabled".to_string()))
    }
}

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug)]
pub struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({"error": self.1}))).into_response()
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError(StatusCode::INTERNAL_SERVER_ERROR, s)
    }
}

fn not_found(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::NOT_FOUND, msg.into())
}

fn bad_request(msg: impl Into<String>) -> AppError {
    AppError(StatusCode::BAD_REQUEST, msg.into())
}

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Deserialize)]
struct GetParams {
    ts: Option<String>,
    cluster: Option<String>,
    pct: Option<String>,
}

#[derive(Deserialize)]
struct SnapshotsParams {
    cluster: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    row_store: bool,
    uptime_secs: u64,
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, AppError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(bad_request(format!("missing required parameter '{}'", name))),
    }
}

fn parse_ts(s: &str) -> Result<i64, AppError> {
    s.parse::<i64>()
        .map_err(|_| bad_request(format!("invalid ts '{}': expected unix seconds", s)))
}

/// Percentage in [0, 100) turned into a fraction.
fn parse_pct(s: &str) -> Result<f64, AppError> {
    match s.parse::<f64>() {
        Ok(pct) if (0.0..100.0).contains(&pct) => Ok(pct / 100.0),
        _ => Err(bad_request(format!("invalid pct '{}': expected a number in [0, 100)", s))),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_handler(
    State(state): State<AppState>,
    Query(params): Query<GetParams>,
) -> Result<Response, AppError> {
    let started = Instant::now();
    let result = get_graph(&state, &params).await;

    let runtime_ms = started.elapsed().as_millis() as u64;
    let http_code = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.0,
    };
    let ts = params.ts.as_deref().unwrap_or("");
    let cluster = params.cluster.as_deref().unwrap_or("");
    match &result {
        Err(AppError(code, message)) if code.is_server_error() => {
            error!(ts, cluster, runtime_ms, http_code = code.as_u16(), error = %message, "get failed")
        }
        _ => info!(ts, cluster, runtime_ms, http_code = http_code.as_u16(), "get"),
    }
    result
}

async fn get_graph(state: &AppState, params: &GetParams) -> Result<Response, AppError> {
    let timestamp = parse_ts(required(params.ts.as_deref(), "ts")?)?;
    let cluster = required(params.cluster.as_deref(), "cluster")?.to_string();
    let fraction = match params.pct.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => parse_pct(raw)?,
        None => state.remove_lowest_fraction,
    };
    let db = state.db()?;

    let missing = format!("no snapshot for cluster '{}' at {}", cluster, timestamp);
    let graph = tokio::task::spawn_blocking(move || db.load_snapshot(timestamp, &cluster, fraction))
        .await
        .map_err(|e| AppError::from(e.to_string()))?
        .map_err(|e| AppError::from(e.to_string()))?
        .ok_or_else(|| not_found(missing))?;

    let body = serde_json::to_vec(&graph)
        .map_err(|e| AppError::from(format!("failed to encode graph: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn snapshots_handler(
    State(state): State<AppState>,
    Query(params): Query<SnapshotsParams>,
) -> Result<Json<Vec<i64>>, AppError> {
    let cluster = required(params.cluster.as_deref(), "cluster")?.to_string();
    let db = state.db()?;
    let timestamps = tokio::task::spawn_blocking(move || db.list_snapshots(&cluster))
        .await
        .map_err(|e| AppError::from(e.to_string()))?
        .map_err(|e| AppError::from(e.to_string()))?;
    Ok(Json(timestamps))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        row_store: state.db.is_some(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/get", get(get_handler))
        .route("/snapshots", get(snapshots_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}
