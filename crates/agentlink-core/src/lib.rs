//! AgentLink core library.
//!
//! Shared plumbing used by AgentLink services: SQLite pool helpers, the
//! common `DatabaseError`, unix timestamps, and tracing initialization.

pub mod db;
pub mod tracing_init;

pub use db::{unix_timestamp, DatabaseError};
