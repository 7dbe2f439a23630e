//! Wire protocol for the relay's WebSocket endpoints.
//!
//! Frames are JSON objects discriminated on `type`. Unknown types fail to
//! decode. The `ts` field is carried as a raw JSON value so that numeric
//! and string timestamps from peers survive forwarding verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentlink_core::unix_timestamp;

/// Close code sent to an agent handle evicted by a newer connection for
/// the same agent id.
pub const CLOSE_CONFLICT: u16 = 4409;
/// Close code for handles reaped by the idle timeout.
pub const CLOSE_IDLE: u16 = 4408;
/// Close code for protocol violations (bad hello, oversize, flooding).
pub const CLOSE_POLICY: u16 = 1008;

/// Stable error codes surfaced in HTTP bodies and WS `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    TokenExpired,
    TokenInvalid,
    InvalidCredentials,
    PairingInvalid,
    PairingExpired,
    PairingAttemptsExceeded,
    AgentSecretMismatch,
    AgentOffline,
    AgentNotPaired,
    MessageTooLarge,
    InvalidMessage,
    RateLimited,
    FreePlanLimit,
    InternalError,
}

impl ErrorCode {
    /// HTTP status the code maps to when surfaced over the REST surface.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Unauthorized
            | Self::TokenExpired
            | Self::TokenInvalid
            | Self::InvalidCredentials
            | Self::AgentSecretMismatch => 401,
            Self::PairingInvalid | Self::PairingExpired | Self::PairingAttemptsExceeded => 400,
            Self::AgentNotPaired => 403,
            Self::FreePlanLimit => 402,
            Self::MessageTooLarge => 413,
            Self::InvalidMessage => 400,
            Self::RateLimited => 429,
            Self::AgentOffline => 503,
            Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde renders the canonical SCREAMING_SNAKE_CASE name
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Connection role announced in the `hello` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Client,
}

/// A WebSocket frame, discriminated on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "hello")]
    Hello {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "presence")]
    Presence {
        agent_id: String,
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "presence.request")]
    PresenceRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "chat.request")]
    ChatRequest {
        request_id: String,
        agent_id: String,
        session_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "chat.response")]
    ChatResponse {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "message_sent")]
    MessageSent {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<Value>,
    },
}

impl Frame {
    /// Server timestamp as a JSON value for stamping outbound frames.
    pub fn now_ts() -> Option<Value> {
        Some(Value::from(unix_timestamp()))
    }

    pub fn presence(agent_id: impl Into<String>, online: bool) -> Self {
        Self::Presence {
            agent_id: agent_id.into(),
            online,
            ts: Self::now_ts(),
        }
    }

    pub fn message_sent(request_id: impl Into<String>) -> Self {
        Self::MessageSent {
            request_id: request_id.into(),
            ts: Self::now_ts(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            request_id: None,
            code,
            message: message.into(),
        }
    }

    pub fn request_error(
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            request_id: Some(request_id.into()),
            code,
            message: message.into(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong { ts: Self::now_ts() }
    }

    pub fn ping() -> Self {
        Self::Ping { ts: Self::now_ts() }
    }
}

/// Pick the reply body from a `chat.response`, accepting the legacy
/// `text` and `message` field names. Egress frames always carry `reply`.
pub fn response_body<'a>(
    reply: Option<&'a str>,
    text: Option<&'a str>,
    message: Option<&'a str>,
) -> Option<&'a str> {
    reply.or(text).or(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_request() {
        let json = r#"{"type":"chat.request","request_id":"r1","agent_id":"a1","session_id":"s1","text":"hi","ts":1700000000}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::ChatRequest {
                request_id,
                agent_id,
                text,
                ts,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(agent_id, "a1");
                assert_eq!(text, "hi");
                assert_eq!(ts, Some(Value::from(1_700_000_000)));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let json = r#"{"type":"chat.unknown","request_id":"r1"}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        // chat.request without text
        let json = r#"{"type":"chat.request","request_id":"r1","agent_id":"a1","session_id":"s1"}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
    }

    #[test]
    fn string_ts_survives_roundtrip() {
        let json = r#"{"type":"ping","ts":"2026-01-01T00:00:00Z"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        let out = serde_json::to_string(&frame).unwrap();
        assert!(out.contains(r#""ts":"2026-01-01T00:00:00Z""#));
    }

    #[test]
    fn error_codes_render_screaming_snake() {
        let frame = Frame::error(ErrorCode::MessageTooLarge, "too big");
        let out = serde_json::to_string(&frame).unwrap();
        assert!(out.contains(r#""code":"MESSAGE_TOO_LARGE""#));
        assert_eq!(ErrorCode::FreePlanLimit.to_string(), "FREE_PLAN_LIMIT");
    }

    #[test]
    fn response_body_prefers_reply() {
        assert_eq!(
            response_body(Some("a"), Some("b"), Some("c")),
            Some("a")
        );
        assert_eq!(response_body(None, Some("b"), Some("c")), Some("b"));
        assert_eq!(response_body(None, None, Some("c")), Some("c"));
        assert_eq!(response_body(None, None, None), None);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::FreePlanLimit.http_status(), 402);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::PairingExpired.http_status(), 400);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
    }
}
