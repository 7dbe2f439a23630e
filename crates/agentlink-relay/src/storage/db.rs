//! Relay database handle.

agentlink_core::define_database!(RelayDatabase, "Relay database migrations complete");
