//! Agent WebSocket endpoint.
//!
//! Agents authenticate with their bearer secret and an `agent_id` query
//! parameter, announce themselves with a `hello{role=agent}` frame, then
//! stream `chat.response`, `presence`, and `ping` frames.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{ErrorCode, Frame, Role, CLOSE_POLICY};
use crate::registry::Outbound;
use crate::storage::Agent;

use super::error::ApiError;
use super::ws_common::{await_hello, bearer_token, spawn_writer, RateWindow};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct AgentWsQuery {
    pub agent_id: String,
}

/// Authenticate and upgrade an agent connection.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<AgentWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(secret) = bearer_token(&headers) else {
        return ApiError::unauthorized().into_response();
    };

    match state.authority.verify_agent(&query.agent_id, secret).await {
        Ok(agent) => ws.on_upgrade(move |socket| handle_socket(socket, state, agent)),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, agent: Agent) {
    let max_bytes = state.config.msg_max_bytes;
    let (sink, mut receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<Outbound>(64);
    let writer = spawn_writer(sink, rx);

    let hello = match await_hello(&mut receiver, max_bytes).await {
        Ok(frame) => frame,
        Err(e) => {
            if let Some(frame) = e.frame() {
                let _ = tx.send(Outbound::Frame(frame)).await;
            }
            let _ = tx
                .send(Outbound::Close {
                    code: CLOSE_POLICY,
                    reason: "bad hello",
                })
                .await;
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    // The hello must name the agent role; a mismatched agent_id claim is
    // ignored in favor of the authenticated identity.
    if !matches!(hello, Frame::Hello { role: Role::Agent, .. }) {
        let _ = tx
            .send(Outbound::Frame(Frame::error(
                ErrorCode::InvalidMessage,
                "expected hello with role=agent",
            )))
            .await;
        let _ = tx
            .send(Outbound::Close {
                code: CLOSE_POLICY,
                reason: "bad hello",
            })
            .await;
        drop(tx);
        let _ = writer.await;
        return;
    }

    info!(agent_id = %agent.id, "Agent connected");

    let handle = state
        .router
        .admit_agent(&agent.id, agent.tenant_id.clone(), tx)
        .await;

    let mut rate = RateWindow::new(
        state.config.ws_rate_max,
        Duration::from_secs(state.config.ws_rate_window_secs),
    );

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                handle
                    .send(Frame::error(
                        ErrorCode::InvalidMessage,
                        "binary frames are not accepted",
                    ))
                    .await;
                handle.close(CLOSE_POLICY, "binary frame").await;
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                handle.touch();
                continue;
            }
            Ok(Message::Close(_)) | Err(_) => break,
        };

        if text.len() > max_bytes {
            handle
                .send(Frame::error(ErrorCode::MessageTooLarge, "frame too large"))
                .await;
            handle.close(CLOSE_POLICY, "frame too large").await;
            break;
        }

        if !rate.allow(Instant::now()) {
            handle
                .send(Frame::error(ErrorCode::RateLimited, "message rate exceeded"))
                .await;
            handle.close(CLOSE_POLICY, "rate limited").await;
            break;
        }

        let frame = match serde_json::from_str::<Frame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                handle
                    .send(Frame::error(ErrorCode::InvalidMessage, "unparseable frame"))
                    .await;
                handle.close(CLOSE_POLICY, "invalid frame").await;
                break;
            }
        };

        handle.touch();

        match frame {
            Frame::ChatResponse { .. } => {
                state.router.handle_chat_response(&handle, frame).await;
            }
            Frame::Presence { .. } => {
                // Accepted for liveness; the router's registry is the
                // presence authority, so the content is not rebroadcast.
                debug!(agent_id = %handle.agent_id, "Agent presence frame");
            }
            Frame::Ping { .. } => {
                handle.send(Frame::pong()).await;
            }
            Frame::Pong { .. } => {}
            _ => {
                handle
                    .send(Frame::error(
                        ErrorCode::InvalidMessage,
                        "frame type not accepted on the agent socket",
                    ))
                    .await;
                handle.close(CLOSE_POLICY, "unexpected frame").await;
                break;
            }
        }
    }

    // Unregister before the writer drains so nothing new is routed here.
    let agent_id = handle.agent_id.clone();
    let conn_id = handle.conn_id;
    drop(handle);
    state.router.remove_agent(&agent_id, conn_id).await;
    info!(agent_id = %agent_id, "Agent disconnected");

    // All senders are gone once the registry entry is dropped, so the
    // writer finishes flushing and exits.
    let _ = writer.await;
}
