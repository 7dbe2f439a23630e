//! In-memory registries of live agent and client connections.

mod connection;

pub use connection::{AgentHandle, ClientHandle, ConnectionRegistry, Outbound};
