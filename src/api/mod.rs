//! Query surface for dashboards
//!
//! - `GET /health`
//! - `GET /api/v1/instance/:stream_key`: node that should collect a stream
//! - `GET /api/v1/history/:store/:key?length=N`: newest lines of a stream
//! - `GET /api/v1/monitor`: this node's load
//! - `GET /api/v1/tail/:store/:key`: WebSocket live tail

mod tail;
mod telemetry;

use crate::cluster::ClusterCoordinator;
use crate::store::StoreKind;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;

/// Lines returned by the history endpoint when `length` is absent.
pub const DEFAULT_HISTORY_LENGTH: usize = 100;

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<ClusterCoordinator>,
}

/// Build the HTTP API router
pub fn build_http_router(coordinator: Arc<ClusterCoordinator>) -> Router {
    use axum::middleware;
    use axum::routing::get;
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/instance/:stream_key", get(suitable_instance))
        .route("/api/v1/history/:store/:key", get(history))
        .route("/api/v1/monitor", get(monitor))
        .route("/api/v1/tail/:store/:key", get(tail::websocket_handler))
        .with_state(ApiState { coordinator })
        .layer(middleware::from_fn(telemetry::http_observability_middleware))
        .layer(cors)
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub length: Option<usize>,
}

async fn health_check() -> &'static str {
    "OK"
}

async fn suitable_instance(
    State(state): State<ApiState>,
    Path(stream_key): Path<String>,
) -> Response {
    let instance = state
        .coordinator
        .router()
        .get_suitable_instance(&stream_key)
        .await;
    Json(instance).into_response()
}

async fn history(
    State(state): State<ApiState>,
    Path((store, key)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let kind = match parse_store(&store) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let length = params.length.unwrap_or(DEFAULT_HISTORY_LENGTH);
    let lines = state
        .coordinator
        .stores()
        .get(kind)
        .get_history_message(&key, length)
        .await;
    Json(lines).into_response()
}

async fn monitor(State(state): State<ApiState>) -> Response {
    Json(state.coordinator.stores().monitor_data()).into_response()
}

pub(crate) fn parse_store(raw: &str) -> std::result::Result<StoreKind, Response> {
    raw.parse::<StoreKind>().map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response()
    })
}
