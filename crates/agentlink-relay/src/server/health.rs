//! Health endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use agentlink_core::unix_timestamp;

use super::AppState;

/// `GET /health` — liveness plus uptime for load balancers and probes.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "ts": unix_timestamp(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}
