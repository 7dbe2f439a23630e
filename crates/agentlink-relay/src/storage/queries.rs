//! Agent, device, pairing, and refresh-token queries.

use agentlink_core::db::unix_timestamp;

use super::db::RelayDatabase;
use super::models::{Agent, Device, Pairing, RefreshToken};
use super::DatabaseError;

/// Outcome of a failed pairing-code consumption.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("Pairing code not found")]
    Invalid,

    #[error("Pairing code expired")]
    Expired,

    #[error("Pairing code attempts exceeded")]
    AttemptsExceeded,

    #[error(transparent)]
    Db(#[from] DatabaseError),
}

impl RelayDatabase {
    // =========================================================================
    // Agent queries
    // =========================================================================

    /// Insert an agent, or update its non-secret fields when the presented
    /// `secret_hash` matches the stored one. A mismatch fails unless
    /// `allow_secret_reset` is set (legacy-fallback path).
    pub async fn upsert_agent(
        &self,
        id: &str,
        display_name: &str,
        secret_hash: &str,
        tenant_id: Option<&str>,
        allow_secret_reset: bool,
    ) -> Result<Agent, DatabaseError> {
        let now = unix_timestamp();

        let existing = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO agents (id, display_name, secret_hash, tenant_id, last_seen_at, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(display_name)
                .bind(secret_hash)
                .bind(tenant_id)
                .bind(now)
                .bind(now)
                .execute(self.pool())
                .await?;
            }
            Some(agent) => {
                if agent.secret_hash != secret_hash && !allow_secret_reset {
                    return Err(DatabaseError::Conflict(format!("Agent {id} secret mismatch")));
                }
                sqlx::query(
                    "UPDATE agents SET display_name = ?, secret_hash = ?, tenant_id = ?, last_seen_at = ? WHERE id = ?",
                )
                .bind(display_name)
                .bind(secret_hash)
                .bind(tenant_id)
                .bind(now)
                .bind(id)
                .execute(self.pool())
                .await?;
            }
        }

        self.get_agent(id).await
    }

    /// Get an agent by ID.
    pub async fn get_agent(&self, id: &str) -> Result<Agent, DatabaseError> {
        super::retry_once(|| async move {
            sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| DatabaseError::NotFound(format!("Agent {id}")))
        })
        .await
    }

    /// Update an agent's `last_seen_at` timestamp.
    pub async fn touch_agent_last_seen(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE agents SET last_seen_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// List agents in a tenant group. `None` (no tenant) is its own group.
    pub async fn list_agents_by_tenant(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Agent>, DatabaseError> {
        let agents = sqlx::query_as::<_, Agent>(
            "SELECT * FROM agents WHERE tenant_id IS ? ORDER BY display_name ASC",
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        Ok(agents)
    }

    // =========================================================================
    // Pairing queries
    // =========================================================================

    /// Issue a pairing code for an agent, replacing any previous one.
    ///
    /// The delete-prior and insert run in one transaction. A unique
    /// violation on the code column surfaces so the caller can regenerate.
    pub async fn issue_pairing(
        &self,
        agent_id: &str,
        code: &str,
        expires_at: i64,
    ) -> Result<Pairing, DatabaseError> {
        let now = unix_timestamp();

        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM pairings WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO pairings (code, agent_id, attempts, expires_at, created_at) VALUES (?, ?, 0, ?, ?)",
        )
        .bind(code)
        .bind(agent_id)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_pairing(code)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Pairing {code}")))
    }

    /// Get a pairing by code.
    pub async fn get_pairing(&self, code: &str) -> Result<Option<Pairing>, DatabaseError> {
        let pairing = sqlx::query_as::<_, Pairing>("SELECT * FROM pairings WHERE code = ?")
            .bind(code)
            .fetch_optional(self.pool())
            .await?;

        Ok(pairing)
    }

    /// Validate a pairing code and charge one consumption attempt.
    ///
    /// Expired codes and codes past the attempt budget are deleted. On
    /// success the attempt is recorded, the code stays live, and the bound
    /// agent snapshot is returned; `delete_pairing` completes the
    /// consumption once the whole pair-complete flow has succeeded, so a
    /// downstream refusal (e.g. the plan limit) does not burn the code.
    pub async fn consume_pairing(
        &self,
        code: &str,
        now: i64,
        max_attempts: i64,
    ) -> Result<Agent, PairingError> {
        let mut tx = self.pool().begin().await.map_err(DatabaseError::from)?;

        let pairing = sqlx::query_as::<_, Pairing>("SELECT * FROM pairings WHERE code = ?")
            .bind(code)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from)?
            .ok_or(PairingError::Invalid)?;

        if pairing.expires_at <= now {
            sqlx::query("DELETE FROM pairings WHERE code = ?")
                .bind(code)
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from)?;
            tx.commit().await.map_err(DatabaseError::from)?;
            return Err(PairingError::Expired);
        }

        if pairing.attempts + 1 > max_attempts {
            sqlx::query("DELETE FROM pairings WHERE code = ?")
                .bind(code)
                .execute(&mut *tx)
                .await
                .map_err(DatabaseError::from)?;
            tx.commit().await.map_err(DatabaseError::from)?;
            return Err(PairingError::AttemptsExceeded);
        }

        sqlx::query("UPDATE pairings SET attempts = attempts + 1 WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(&pairing.agent_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DatabaseError::from)?
            .ok_or(PairingError::Invalid)?;

        tx.commit().await.map_err(DatabaseError::from)?;
        Ok(agent)
    }

    /// Delete a pairing code after successful consumption.
    pub async fn delete_pairing(&self, code: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM pairings WHERE code = ?")
            .bind(code)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Device queries
    // =========================================================================

    /// Create a device bound to an agent.
    pub async fn create_device(
        &self,
        id: &str,
        agent_id: &str,
        label: &str,
        tenant_id: Option<&str>,
        now: i64,
    ) -> Result<Device, DatabaseError> {
        sqlx::query(
            "INSERT INTO devices (id, agent_id, label, tenant_id, revoked, last_seen_at, created_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(agent_id)
        .bind(label)
        .bind(tenant_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(id).await
    }

    /// Get a device by ID.
    pub async fn get_device(&self, id: &str) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// Update a device's `last_seen_at` timestamp.
    pub async fn touch_device_last_seen(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET last_seen_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Revoke a device and delete its refresh tokens in one transaction.
    pub async fn revoke_device(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query("UPDATE devices SET revoked = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM refresh_tokens WHERE device_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Refresh-token queries
    // =========================================================================

    /// Store a refresh-token digest.
    pub async fn store_refresh_token(
        &self,
        token_hash: &str,
        device_id: &str,
        agent_id: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, device_id, agent_id, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(token_hash)
        .bind(device_id)
        .bind(agent_id)
        .bind(expires_at)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Find a live (non-expired) refresh token by digest.
    pub async fn find_refresh_token(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<RefreshToken>, DatabaseError> {
        super::retry_once(|| async move {
            let token = sqlx::query_as::<_, RefreshToken>(
                "SELECT * FROM refresh_tokens WHERE token_hash = ? AND expires_at > ?",
            )
            .bind(token_hash)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;

            Ok(token)
        })
        .await
    }

    /// Rotate a refresh token: delete the presented digest and insert the
    /// successor in a single transaction. Returns `false` (and inserts
    /// nothing) when the old digest was already gone, so a rotated token
    /// can never be replayed.
    pub async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        new_hash: &str,
        device_id: &str,
        agent_id: &str,
        new_expires_at: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let deleted = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = ?")
            .bind(old_hash)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, device_id, agent_id, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_hash)
        .bind(device_id)
        .bind(agent_id)
        .bind(new_expires_at)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Delete a refresh token by digest.
    pub async fn delete_refresh_token(&self, token_hash: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
