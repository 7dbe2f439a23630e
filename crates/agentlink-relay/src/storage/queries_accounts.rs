//! Account, session, and account-agent link queries.

use agentlink_core::db::unix_timestamp;

use super::db::RelayDatabase;
use super::models::Account;
use super::DatabaseError;

impl RelayDatabase {
    // =========================================================================
    // Account queries
    // =========================================================================

    /// Create an account.
    pub async fn create_account(
        &self,
        id: &str,
        email: &str,
        provider: &str,
    ) -> Result<Account, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO accounts (id, email, provider, plan, created_at, updated_at) VALUES (?, ?, ?, 'free', ?, ?)",
        )
        .bind(id)
        .bind(email)
        .bind(provider)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_account(id).await
    }

    /// Get an account by ID.
    pub async fn get_account(&self, id: &str) -> Result<Account, DatabaseError> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Account {id}")))
    }

    /// Find an account by email.
    pub async fn find_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE email = ?")
            .bind(email)
            .fetch_optional(self.pool())
            .await?;

        Ok(account)
    }

    /// Find an account by payment-provider customer id.
    pub async fn find_account_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<Account>, DatabaseError> {
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE stripe_customer_id = ?")
                .bind(customer_id)
                .fetch_optional(self.pool())
                .await?;

        Ok(account)
    }

    /// Update billing state for an account. Plan transitions flow through
    /// here exclusively, driven by verified webhook events.
    pub async fn update_account_billing(
        &self,
        account_id: &str,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
        plan: &str,
        status: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE accounts SET stripe_customer_id = COALESCE(?, stripe_customer_id), stripe_subscription_id = COALESCE(?, stripe_subscription_id), plan = ?, subscription_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(plan)
        .bind(status)
        .bind(unix_timestamp())
        .bind(account_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Session queries
    // =========================================================================

    /// Create or replace the login session for an account.
    pub async fn upsert_session(
        &self,
        token_hash: &str,
        account_id: &str,
        expires_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO account_sessions (account_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET token_hash = excluded.token_hash, expires_at = excluded.expires_at",
        )
        .bind(account_id)
        .bind(token_hash)
        .bind(expires_at)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Resolve a session token digest to its account, if still live.
    pub async fn resolve_session(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<Account>, DatabaseError> {
        super::retry_once(|| async move {
            let account = sqlx::query_as::<_, Account>(
                "SELECT a.* FROM accounts a JOIN account_sessions s ON s.account_id = a.id WHERE s.token_hash = ? AND s.expires_at > ?",
            )
            .bind(token_hash)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;

            Ok(account)
        })
        .await
    }

    // =========================================================================
    // Account-agent link queries
    // =========================================================================

    /// Link an account to an agent. Idempotent.
    pub async fn link_account_agent(
        &self,
        account_id: &str,
        agent_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT OR IGNORE INTO account_agents (account_id, agent_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(account_id)
        .bind(agent_id)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Whether an account is already linked to an agent.
    pub async fn is_account_agent_linked(
        &self,
        account_id: &str,
        agent_id: &str,
    ) -> Result<bool, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM account_agents WHERE account_id = ? AND agent_id = ?",
        )
        .bind(account_id)
        .bind(agent_id)
        .fetch_one(self.pool())
        .await?;

        Ok(row.0 > 0)
    }

    /// Count distinct agents linked to an account.
    pub async fn count_account_agents(&self, account_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM account_agents WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(self.pool())
                .await?;

        Ok(row.0)
    }

    /// List agent ids linked to an account.
    pub async fn list_account_agents(
        &self,
        account_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT agent_id FROM account_agents WHERE account_id = ? ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Replace the full set of agent links for an account in one transaction.
    pub async fn replace_account_agents(
        &self,
        account_id: &str,
        agent_ids: &[String],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM account_agents WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        for agent_id in agent_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO account_agents (account_id, agent_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(account_id)
            .bind(agent_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }
}
