use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};

use crate::{
    broadcast::{serve_socket, BootstrapSource},
    config::InstrumentDescriptor,
    model::{TrainError, TrainReport},
    pipeline::{InstrumentPipeline, InstrumentStats, Pipeline, StreamReport},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Create the API router, websocket included
pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    let state = AppState { pipeline };

    Router::new()
        .route("/health", get(health_check))
        .route("/api", get(index))
        .route("/api/instruments", get(get_instruments))
        .route("/api/streams", get(get_streams))
        .route("/api/stats", get(get_stats))
        .route("/api/stats/reset", post(reset_stats))
        .route("/api/nn/train/:instrument", post(train_instrument))
        .route("/api/nn/status", get(get_nn_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        subscribers: state.pipeline.hub().subscriber_count(),
    })
}

async fn index() -> Json<serde_json::Value> {
    Json(json!({
        "routes": [
            "GET /health",
            "GET /api/instruments",
            "GET /api/streams",
            "GET /api/stats",
            "POST /api/stats/reset",
            "POST /api/nn/train/:instrument",
            "GET /api/nn/status",
            "GET /ws",
        ]
    }))
}

async fn get_instruments(State(state): State<AppState>) -> Json<Vec<InstrumentDescriptor>> {
    Json(
        state
            .pipeline
            .pipelines()
            .iter()
            .map(|p| p.descriptor.clone())
            .collect(),
    )
}

/// Ingest stats, constant predictions and drift records per instrument
async fn get_streams(State(state): State<AppState>) -> Json<HashMap<String, StreamReport>> {
    Json(state.pipeline.streams())
}

async fn get_stats(State(state): State<AppState>) -> Json<Vec<InstrumentStats>> {
    Json(state.pipeline.stats())
}

async fn reset_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.pipeline.reset_stats();
    Json(json!({ "reset": true }))
}

/// Train from the persisted stream; 409 while a job for the instrument is running.
async fn train_instrument(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
) -> Result<Json<TrainReport>, ApiError> {
    let pipeline = lookup(&state, &instrument)?;
    let report = state.pipeline.train(&pipeline).await?;
    Ok(Json(report))
}

async fn get_nn_status(State(state): State<AppState>) -> Json<NnStatusResponse> {
    Json(NnStatusResponse {
        loaded: state.pipeline.registry().loaded(),
        training: state.pipeline.supervisor().running(),
    })
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.pipeline.hub().clone();
    let grace = state.pipeline.config().broadcast.bootstrap_grace();
    // A peer that cannot take a frame within one liveness round is treated as dead.
    let send_timeout = state.pipeline.config().broadcast.liveness_interval();
    let source: Arc<dyn BootstrapSource> = state.pipeline;
    ws.on_upgrade(move |socket| serve_socket(socket, hub, source, grace, send_timeout))
}

fn lookup(state: &AppState, instrument: &str) -> Result<Arc<InstrumentPipeline>, ApiError> {
    state
        .pipeline
        .instrument(instrument)
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("unknown instrument {instrument}")))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    subscribers: usize,
}

#[derive(Serialize)]
struct NnStatusResponse {
    loaded: Vec<String>,
    training: Vec<String>,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<TrainError> for ApiError {
    fn from(err: TrainError) -> Self {
        match err {
            TrainError::Conflict(_) => ApiError::Conflict(err.to_string()),
            TrainError::NoData { .. } | TrainError::Failed { .. } => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
