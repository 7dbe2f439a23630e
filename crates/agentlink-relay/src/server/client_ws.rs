//! Client WebSocket endpoint.
//!
//! Browser clients authenticate with an access token from the
//! `Authorization` header or, for browsers that cannot set headers on
//! upgrade, the `?access_token=` query parameter. After a
//! `hello{role=client}` frame they stream `chat.request`,
//! `presence.request`, and `ping` frames.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::auth::AccessClaims;
use crate::protocol::{ErrorCode, Frame, Role, CLOSE_POLICY};
use crate::registry::Outbound;

use super::error::ApiError;
use super::ws_common::{await_hello, bearer_token, spawn_writer, RateWindow};
use super::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ClientWsQuery {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Authenticate and upgrade a client connection.
pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match bearer_token(&headers) {
        Some(token) => token.to_string(),
        None => match query.access_token {
            Some(token) => token,
            None => return ApiError::unauthorized().into_response(),
        },
    };

    let claims = match state.authority.verify_access(&token) {
        Ok(claims) => claims,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // The device must still exist and not be revoked.
    match state.db.get_device(claims.device_id()).await {
        Ok(device) if device.revoked == 0 => {}
        Ok(_) | Err(agentlink_core::db::DatabaseError::NotFound(_)) => {
            return ApiError::unauthorized().into_response()
        }
        Err(e) => return ApiError::from(e).into_response(),
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, claims))
}

async fn handle_socket(socket: WebSocket, state: AppState, claims: AccessClaims) {
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

    if !matches!(hello, Frame::Hello { role: Role::Client, .. }) {
        let _ = tx
            .send(Outbound::Frame(Frame::error(
                ErrorCode::InvalidMessage,
                "expected hello with role=client",
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

    info!(
        agent_id = %claims.agent_id,
        device_id = %claims.device_id(),
        "Client connected"
    );

    let handle = state
        .router
        .admit_client(&claims.agent_id, claims.device_id(), tx)
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
            Frame::ChatRequest { .. } => {
                state.router.handle_chat_request(&handle, frame).await;
            }
            Frame::PresenceRequest { .. } => {
                state.router.handle_presence_request(&handle).await;
            }
            Frame::Ping { .. } => {
                handle.send(Frame::pong()).await;
            }
            Frame::Pong { .. } => {}
            _ => {
                handle
                    .send(Frame::error(
                        ErrorCode::InvalidMessage,
                        "frame type not accepted on the client socket",
                    ))
                    .await;
                handle.close(CLOSE_POLICY, "unexpected frame").await;
                break;
            }
        }
    }

    let agent_id = handle.agent_id.clone();
    let device_id = handle.device_id.clone();
    let conn_id = handle.conn_id;
    drop(handle);
    state.router.remove_client(&agent_id, &device_id, conn_id).await;
    info!(agent_id = %agent_id, device_id = %device_id, "Client disconnected");

    let _ = writer.await;
}
