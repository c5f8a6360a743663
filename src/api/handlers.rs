use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::ingest::{IngestError, IngestPipeline, Outcome, PipelineStatsSnapshot};
use crate::storage::BufferedRequest;
use crate::workerpool::JobStatsSnapshot;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Application state shared across handlers
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub outcome: &'static str,
    /// Spans handed to the feeder
    pub spans: usize,
}

impl Outcome {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Outcome::Fed(_) | Outcome::Filtered => StatusCode::OK,
            Outcome::Buffered => StatusCode::ACCEPTED,
            Outcome::Dropped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<Outcome> for IngestResponse {
    fn from(outcome: Outcome) -> Self {
        let (outcome, spans) = match outcome {
            Outcome::Fed(n) => ("fed", n),
            Outcome::Filtered => ("filtered", 0),
            Outcome::Buffered => ("buffered", 0),
            Outcome::Dropped => ("dropped", 0),
        };
        Self { outcome, spans }
    }
}

/// Capture the raw request and run it through the pipeline
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read body: {}", e)))?;

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let request = BufferedRequest::from_parts(&parts, &body, remote_addr);

    let outcome = state.pipeline.handle_request(request).await?;
    Ok((outcome.status_code(), Json(outcome.into())))
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsResponse {
    pub input: String,
    pub pipeline: PipelineStatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobStatsSnapshot>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageInfo>,
}

#[derive(Serialize)]
pub struct StorageInfo {
    pub enabled: bool,
    pub pending: usize,
    pub discarded: u64,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub usage_percent: f64,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let pipeline = &state.pipeline;

    let storage = pipeline.storage().map(|s| {
        let used_bytes = s.used_bytes();
        let capacity_bytes = s.capacity();
        StorageInfo {
            enabled: s.enabled(),
            pending: s.pending_total(),
            discarded: s.discarded(),
            used_bytes,
            capacity_bytes,
            usage_percent: if capacity_bytes == 0 {
                0.0
            } else {
                used_bytes as f64 / capacity_bytes as f64 * 100.0
            },
        }
    });

    Json(StatsResponse {
        input: pipeline.name().to_string(),
        pipeline: pipeline.stats().snapshot(),
        jobs: pipeline.pool().map(|p| p.stats().snapshot()),
        storage,
    })
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    TooManyRequests(String),
    Unavailable(String),
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        let message = e.to_string();
        match e {
            IngestError::AdmissionRejected(_) => ApiError::TooManyRequests(message),
            IngestError::Decode(_) => ApiError::BadRequest(message),
            IngestError::Crashed(_) => ApiError::Internal(message),
            IngestError::Pool(_) | IngestError::Abandoned => ApiError::Unavailable(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
