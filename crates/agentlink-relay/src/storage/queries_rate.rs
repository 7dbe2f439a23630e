//! Rate-counter and expiry cleanup queries.

use super::db::RelayDatabase;
use super::DatabaseError;

/// Rows removed by a `cleanup` pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub refresh_tokens: u64,
    pub pairings: u64,
    pub sessions: u64,
    pub rate_counters: u64,
}

impl CleanupStats {
    pub fn total(&self) -> u64 {
        self.refresh_tokens + self.pairings + self.sessions + self.rate_counters
    }
}

impl RelayDatabase {
    /// Sliding-window rate check for `key`.
    ///
    /// The first attempt inserts a fresh window; an expired window resets;
    /// otherwise the counter increments and is compared against `max`.
    pub async fn rate_check(
        &self,
        key: &str,
        max: i64,
        window_secs: i64,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT count, window_start FROM rate_counters WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let allowed = match row {
            None => {
                sqlx::query(
                    "INSERT INTO rate_counters (key, count, window_start) VALUES (?, 1, ?)",
                )
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                true
            }
            Some((_, window_start)) if window_start + window_secs <= now => {
                sqlx::query("UPDATE rate_counters SET count = 1, window_start = ? WHERE key = ?")
                    .bind(now)
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            Some((count, _)) if count < max => {
                sqlx::query("UPDATE rate_counters SET count = count + 1 WHERE key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            Some(_) => false,
        };

        tx.commit().await?;
        Ok(allowed)
    }

    /// Delete expired refresh tokens, pairings, account sessions, and rate
    /// counters older than one hour.
    pub async fn cleanup(&self, now: i64) -> Result<CleanupStats, DatabaseError> {
        let refresh_tokens = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        let pairings = sqlx::query("DELETE FROM pairings WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        let sessions = sqlx::query("DELETE FROM account_sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(self.pool())
            .await?
            .rows_affected();

        let rate_counters = sqlx::query("DELETE FROM rate_counters WHERE window_start <= ?")
            .bind(now - 3600)
            .execute(self.pool())
            .await?
            .rows_affected();

        Ok(CleanupStats {
            refresh_tokens,
            pairings,
            sessions,
            rate_counters,
        })
    }
}
