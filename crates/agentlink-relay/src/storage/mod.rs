//! SQLite storage for the AgentLink relay.
//!
//! Persists agents, devices, pairing codes, refresh-token digests,
//! accounts, account sessions, account-agent links, and rate counters.
//! Chat payloads are never written here.

mod db;
mod models;
mod queries;
mod queries_accounts;
mod queries_rate;

#[cfg(test)]
mod tests;

pub use db::RelayDatabase;
pub use models::*;
pub use queries::PairingError;
pub use queries_rate::CleanupStats;

pub use agentlink_core::db::DatabaseError;

use std::future::Future;
use std::time::Duration;

/// Retry an idempotent query once, with jitter, on a transient failure.
/// Logical outcomes (not-found, conflicts) are returned as-is.
pub(crate) async fn retry_once<T, F, Fut>(op: F) -> Result<T, DatabaseError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    match op().await {
        Err(e @ (DatabaseError::Query(_) | DatabaseError::Connection(_))) => {
            let jitter = Duration::from_millis(10 + rand::random::<u64>() % 40);
            tracing::warn!(error = %e, "Transient store error, retrying once");
            tokio::time::sleep(jitter).await;
            op().await
        }
        other => other,
    }
}
