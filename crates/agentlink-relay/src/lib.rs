//! AgentLink relay library.
//!
//! A pass-through broker that pairs browser clients with server-side AI
//! agents:
//! - SQLite storage for agents, devices, pairings, tokens, and accounts
//! - JWT access tokens and rotating opaque refresh tokens
//! - A WebSocket router with presence broadcast and per-agent offline
//!   queuing; message bodies are never persisted
//! - HTTP surface for pairing, token refresh, account auth, and billing
//!   callbacks

pub mod auth;
pub mod billing;
pub mod buffer;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
