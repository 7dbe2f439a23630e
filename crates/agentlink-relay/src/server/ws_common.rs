//! Shared plumbing for the two WebSocket endpoints: bearer extraction,
//! the writer task, the hello handshake, and per-connection rate limiting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ErrorCode, Frame};
use crate::registry::Outbound;

/// How long a peer gets to send its `hello` after the upgrade.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Drive a writer channel into the socket sink. Serializes frames and
/// terminates on a close instruction or a dead socket, keeping all writes
/// on one task so per-destination order holds.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    })
}

/// Why the hello handshake failed.
pub enum HelloError {
    Timeout,
    Gone,
    TooLarge,
    Invalid,
}

impl HelloError {
    pub fn frame(&self) -> Option<Frame> {
        match self {
            Self::Timeout | Self::Gone => None,
            Self::TooLarge => Some(Frame::error(
                ErrorCode::MessageTooLarge,
                "hello frame too large",
            )),
            Self::Invalid => Some(Frame::error(
                ErrorCode::InvalidMessage,
                "first frame must be hello",
            )),
        }
    }
}

/// Wait for the peer's first frame and require it to be a valid `hello`
/// within the size cap.
pub async fn await_hello(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
    max_bytes: usize,
) -> Result<Frame, HelloError> {
    loop {
        let msg = tokio::time::timeout(HELLO_TIMEOUT, receiver.next())
            .await
            .map_err(|_| HelloError::Timeout)?;

        match msg {
            Some(Ok(Message::Text(text))) => {
                if text.len() > max_bytes {
                    return Err(HelloError::TooLarge);
                }
                return match serde_json::from_str::<Frame>(&text) {
                    Ok(frame @ Frame::Hello { .. }) => Ok(frame),
                    _ => Err(HelloError::Invalid),
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => return Err(HelloError::Invalid),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(HelloError::Gone),
        }
    }
}

/// Sliding-window message-rate limiter for a single connection.
pub struct RateWindow {
    timestamps: VecDeque<Instant>,
    max: usize,
    window: Duration,
}

impl RateWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(max.min(256)),
            max,
            window,
        }
    }

    /// Record an event at `now`; returns whether it stays within the rate.
    pub fn allow(&mut self, now: Instant) -> bool {
        while matches!(self.timestamps.front(), Some(&front) if now.duration_since(front) >= self.window)
        {
            self.timestamps.pop_front();
        }
        if self.timestamps.len() >= self.max {
            return false;
        }
        self.timestamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_window_caps_burst() {
        let mut window = RateWindow::new(3, Duration::from_secs(60));
        let now = Instant::now();

        assert!(window.allow(now));
        assert!(window.allow(now));
        assert!(window.allow(now));
        assert!(!window.allow(now));
    }

    #[test]
    fn rate_window_recovers_after_window() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(window.allow(start));
        assert!(window.allow(start));
        assert!(!window.allow(start));

        let later = start + Duration::from_secs(61);
        assert!(window.allow(later));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok-123".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        let mut bad = HeaderMap::new();
        bad.insert(axum::http::header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&bad), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
