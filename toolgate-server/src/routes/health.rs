//! Health and metrics endpoints.

use crate::metrics::MetricsSnapshot;
use crate::state::SharedState;
use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

/// GET /v1/health
pub async fn health(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "providers": state.connectors.provider_names().len(),
    }))
}

/// GET /v1/metrics: point-in-time snapshot of all collected series.
pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
