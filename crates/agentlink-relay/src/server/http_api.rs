//! Pairing, token, and agent-listing endpoints.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agentlink_core::db::DatabaseError;
use agentlink_core::unix_timestamp;

use crate::auth::{PairComplete, PairStart, TokenPair};

use super::error::ApiError;
use super::ws_common::bearer_token;
use super::AppState;

/// Agents within five minutes of their last connect or disconnect are
/// listed as online.
const AGENT_ONLINE_WINDOW_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
pub struct PairStartBody {
    pub agent_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// `POST /api/pair/start` — agent-authenticated; issues a pairing code.
pub async fn pair_start(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PairStartBody>,
) -> Result<Json<PairStart>, ApiError> {
    let Some(secret) = bearer_token(&headers) else {
        return Err(ApiError::unauthorized());
    };

    let display_name = body.display_name.as_deref().unwrap_or(&body.agent_id);
    let started = state
        .authority
        .pair_start(
            &body.agent_id,
            display_name,
            body.tenant_id.as_deref(),
            secret,
            &addr.ip().to_string(),
        )
        .await?;

    Ok(Json(started))
}

#[derive(Debug, Deserialize)]
pub struct PairCompleteBody {
    pub code: String,
    #[serde(default)]
    pub device_label: Option<String>,
}

/// `POST /api/pair/complete` — consumes a code; optional account session.
pub async fn pair_complete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PairCompleteBody>,
) -> Result<Json<PairComplete>, ApiError> {
    let label = body.device_label.as_deref().unwrap_or("browser");
    let completed = state
        .authority
        .pair_complete(
            &body.code,
            label,
            bearer_token(&headers),
            &addr.ip().to_string(),
        )
        .await?;

    Ok(Json(completed))
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

/// `POST /api/token/refresh` — rotate a refresh token.
pub async fn token_refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<TokenPair>, ApiError> {
    let pair = state.authority.refresh(&body.refresh_token).await?;
    Ok(Json(pair))
}

/// `POST /api/token/revoke` — always succeeds, so callers cannot probe
/// for live tokens.
pub async fn token_revoke(
    State(state): State<AppState>,
    Json(body): Json<RefreshBody>,
) -> Result<Json<Value>, ApiError> {
    state.authority.revoke(&body.refresh_token).await?;
    Ok(Json(json!({ "revoked": true })))
}

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub id: String,
    pub display_name: String,
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentSummary>,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// `GET /api/agents` — every agent in the caller device's tenant group
/// (no tenant is its own group).
pub async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AgentsResponse>, ApiError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(ApiError::unauthorized());
    };
    let claims = state.authority.verify_access(token)?;

    match state.db.get_device(claims.device_id()).await {
        Ok(device) if device.revoked == 0 => {}
        Ok(_) | Err(DatabaseError::NotFound(_)) => return Err(ApiError::unauthorized()),
        Err(e) => return Err(e.into()),
    }

    let now = unix_timestamp();
    let agents = state
        .db
        .list_agents_by_tenant(claims.tenant_id.as_deref())
        .await?
        .into_iter()
        .map(|agent| AgentSummary {
            online: agent.last_seen_at > now - AGENT_ONLINE_WINDOW_SECS,
            id: agent.id,
            display_name: agent.display_name,
            last_seen_at: Some(agent.last_seen_at),
        })
        .collect();

    Ok(Json(AgentsResponse {
        agents,
        device_id: claims.device_id().to_string(),
        tenant_id: claims.tenant_id,
    }))
}
