use axum::{
    Json,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};

use super::InternalState;
use crate::metrics;

/// Health check endpoint - returns relay status
pub async fn health_handler(State(state): State<InternalState>) -> impl IntoResponse {
    let snapshot = state.relay.metrics.snapshot();

    Json(metrics::HealthStatus {
        status: "healthy".to_string(),
        server_id: state.server_id.clone(),
        distribution_enabled: state.distribution_enabled,
        connections: snapshot.connections.active,
        rooms: state.relay.registry.room_counts().await,
        history_len: state.relay.history.len().await,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Prometheus scrape endpoint. Falls back to the JSON snapshot when no
/// recorder is installed.
pub async fn metrics_handler(State(state): State<InternalState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => Json(state.relay.metrics.snapshot()).into_response(),
    }
}

/// Detailed counters as JSON
pub async fn metrics_json_handler(State(state): State<InternalState>) -> impl IntoResponse {
    Json(state.relay.metrics.snapshot())
}
