//! Credential authority: pairing, token issuance, rotation, and
//! verification flows.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use agentlink_core::db::{unix_timestamp, DatabaseError};

use crate::billing::plan;
use crate::config::RelayConfig;
use crate::protocol::ErrorCode;
use crate::storage::{Account, Agent, PairingError, RelayDatabase};

use super::claims::AccessClaims;
use super::jwt::TokenManager;
use super::pairing::{generate_pairing_code, new_opaque_token};
use super::secret::{constant_time_str_eq, hash_agent_secret, verify_agent_secret};

/// Extra generation attempts after a pairing-code collision.
const CODE_RETRIES: usize = 3;

/// Credential-flow failures, mapped onto the stable wire codes.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Access token expired")]
    TokenExpired,

    #[error("Invalid access token")]
    TokenInvalid,

    #[error("Rate limited")]
    RateLimited,

    #[error("Invalid pairing code")]
    PairingInvalid,

    #[error("Pairing code expired")]
    PairingExpired,

    #[error("Too many attempts for pairing code")]
    PairingAttemptsExceeded,

    #[error("Agent secret mismatch")]
    AgentSecretMismatch,

    #[error("Free plan agent limit reached")]
    FreePlanLimit,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::TokenExpired => ErrorCode::TokenExpired,
            Self::TokenInvalid => ErrorCode::TokenInvalid,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::PairingInvalid => ErrorCode::PairingInvalid,
            Self::PairingExpired => ErrorCode::PairingExpired,
            Self::PairingAttemptsExceeded => ErrorCode::PairingAttemptsExceeded,
            Self::AgentSecretMismatch => ErrorCode::AgentSecretMismatch,
            Self::FreePlanLimit => ErrorCode::FreePlanLimit,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl From<DatabaseError> for AuthError {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<PairingError> for AuthError {
    fn from(e: PairingError) -> Self {
        match e {
            PairingError::Invalid => Self::PairingInvalid,
            PairingError::Expired => Self::PairingExpired,
            PairingError::AttemptsExceeded => Self::PairingAttemptsExceeded,
            PairingError::Db(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Result of pair-start.
#[derive(Debug, Clone, Serialize)]
pub struct PairStart {
    pub code: String,
    pub expires_at: i64,
    pub agent_id: String,
}

/// Result of pair-complete.
#[derive(Debug, Clone, Serialize)]
pub struct PairComplete {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub agent_id: String,
    pub agent_display_name: String,
    pub device_id: String,
}

/// Result of a token refresh.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// Issues, rotates, and verifies every credential the relay hands out.
#[derive(Clone)]
pub struct CredentialAuthority {
    db: RelayDatabase,
    tokens: Arc<TokenManager>,
    config: Arc<RelayConfig>,
}

impl CredentialAuthority {
    pub fn new(db: RelayDatabase, tokens: Arc<TokenManager>, config: Arc<RelayConfig>) -> Self {
        Self { db, tokens, config }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Verify an agent's bearer secret. Falls back to the single global
    /// secret when the per-agent check fails and the legacy flag is set.
    pub async fn verify_agent(&self, agent_id: &str, secret: &str) -> Result<Agent, AuthError> {
        let agent = match self.db.get_agent(agent_id).await {
            Ok(agent) => agent,
            Err(DatabaseError::NotFound(_)) => return Err(AuthError::Unauthorized),
            Err(e) => return Err(e.into()),
        };

        if verify_agent_secret(agent_id, secret, &agent.secret_hash)
            || self.legacy_secret_matches(secret)
        {
            Ok(agent)
        } else {
            warn!(agent_id = %agent_id, "Agent secret verification failed");
            Err(AuthError::Unauthorized)
        }
    }

    /// Verify an access token and return its claims.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.tokens.verify(token).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::TokenInvalid,
        })
    }

    /// Start pairing: rate-check, register-or-verify the agent, and issue
    /// a fresh code replacing any previous one.
    pub async fn pair_start(
        &self,
        agent_id: &str,
        display_name: &str,
        tenant_id: Option<&str>,
        secret: &str,
        ip: &str,
    ) -> Result<PairStart, AuthError> {
        self.check_pairing_rate(ip).await?;

        let secret_hash = hash_agent_secret(agent_id, secret);
        let agent = match self
            .db
            .upsert_agent(agent_id, display_name, &secret_hash, tenant_id, false)
            .await
        {
            Ok(agent) => agent,
            Err(DatabaseError::Conflict(_)) => {
                if self.legacy_secret_matches(secret) {
                    // Legacy deployments rotate the per-agent secret here.
                    self.db
                        .upsert_agent(agent_id, display_name, &secret_hash, tenant_id, true)
                        .await?
                } else {
                    return Err(AuthError::AgentSecretMismatch);
                }
            }
            Err(e) => return Err(e.into()),
        };

        let expires_at = unix_timestamp() + self.config.pairing_ttl_secs;
        let code = self.issue_code(&agent.id, expires_at).await?;

        info!(agent_id = %agent.id, "Pairing code issued");

        Ok(PairStart {
            code,
            expires_at,
            agent_id: agent.id,
        })
    }

    /// Complete pairing: consume the code, enforce the plan allowance,
    /// create the device, and issue the first token pair.
    pub async fn pair_complete(
        &self,
        code: &str,
        device_label: &str,
        session_token: Option<&str>,
        ip: &str,
    ) -> Result<PairComplete, AuthError> {
        self.check_pairing_rate(ip).await?;

        let account = match session_token {
            Some(token) => Some(self.resolve_session(token).await?),
            None => None,
        };

        let now = unix_timestamp();
        let agent = self
            .db
            .consume_pairing(code, now, self.config.pairing_max_attempts)
            .await?;

        if let Some(account) = &account {
            self.check_agent_allowance(account, &agent.id).await?;
        }

        let device_id = uuid::Uuid::new_v4().to_string();
        let device = self
            .db
            .create_device(&device_id, &agent.id, device_label, agent.tenant_id.as_deref(), now)
            .await?;

        let refresh_token = new_opaque_token();
        let refresh_hash = TokenManager::hash_token(&refresh_token);
        self.db
            .store_refresh_token(
                &refresh_hash,
                &device.id,
                &agent.id,
                now + self.config.refresh_ttl_secs,
            )
            .await?;

        let (access_token, expires_in) =
            self.tokens
                .issue_access(&device.id, &agent.id, agent.tenant_id.as_deref())?;

        if let Some(account) = &account {
            self.db.link_account_agent(&account.id, &agent.id).await?;
        }

        self.db.delete_pairing(code).await?;

        info!(agent_id = %agent.id, device_id = %device.id, "Device paired");

        Ok(PairComplete {
            access_token,
            refresh_token,
            expires_in,
            agent_id: agent.id,
            agent_display_name: agent.display_name,
            device_id: device.id,
        })
    }

    /// Exchange a refresh token for a new access/refresh pair, rotating
    /// the stored digest atomically. A rotated token is never re-accepted.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let now = unix_timestamp();
        let old_hash = TokenManager::hash_token(refresh_token);

        let stored = self
            .db
            .find_refresh_token(&old_hash, now)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        let device = match self.db.get_device(&stored.device_id).await {
            Ok(device) if device.revoked == 0 => device,
            Ok(_) | Err(DatabaseError::NotFound(_)) => return Err(AuthError::Unauthorized),
            Err(e) => return Err(e.into()),
        };

        let next_token = new_opaque_token();
        let next_hash = TokenManager::hash_token(&next_token);

        let rotated = self
            .db
            .rotate_refresh_token(
                &old_hash,
                &next_hash,
                &stored.device_id,
                &stored.agent_id,
                now + self.config.refresh_ttl_secs,
            )
            .await?;
        if !rotated {
            // Lost a race with another presentation of the same token.
            return Err(AuthError::Unauthorized);
        }

        let (access_token, expires_in) = self.tokens.issue_access(
            &stored.device_id,
            &stored.agent_id,
            device.tenant_id.as_deref(),
        )?;

        self.db.touch_device_last_seen(&stored.device_id).await?;

        Ok(TokenPair {
            access_token,
            refresh_token: next_token,
            expires_in,
            token_type: "Bearer".to_string(),
        })
    }

    /// Revoke a refresh token. Succeeds whether or not the token existed,
    /// so callers cannot probe for live tokens.
    pub async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError> {
        let hash = TokenManager::hash_token(refresh_token);
        self.db.delete_refresh_token(&hash).await?;
        Ok(())
    }

    /// Open (or replace) the login session for the account with this email,
    /// creating the account on first sight. Returns the bearer token, the
    /// account, and the session expiry.
    pub async fn open_account_session(
        &self,
        email: &str,
        provider: &str,
    ) -> Result<(String, Account, i64), AuthError> {
        let account = match self.db.find_account_by_email(email).await? {
            Some(account) => account,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let account = self.db.create_account(&id, email, provider).await?;
                info!(account_id = %account.id, provider = %provider, "Account created");
                account
            }
        };

        let token = new_opaque_token();
        let expires_at = unix_timestamp() + self.config.session_ttl_secs;
        self.db
            .upsert_session(&TokenManager::hash_token(&token), &account.id, expires_at)
            .await?;

        Ok((token, account, expires_at))
    }

    /// Resolve an account-session bearer to its account.
    pub async fn resolve_session(&self, session_token: &str) -> Result<Account, AuthError> {
        let hash = TokenManager::hash_token(session_token);
        self.db
            .resolve_session(&hash, unix_timestamp())
            .await?
            .ok_or(AuthError::Unauthorized)
    }

    async fn check_pairing_rate(&self, ip: &str) -> Result<(), AuthError> {
        let allowed = self
            .db
            .rate_check(
                &format!("{ip}:pairing"),
                self.config.pairing_rate_max,
                self.config.pairing_rate_window_secs,
                unix_timestamp(),
            )
            .await?;

        if allowed {
            Ok(())
        } else {
            warn!(ip = %ip, "Pairing rate limit hit");
            Err(AuthError::RateLimited)
        }
    }

    async fn check_agent_allowance(
        &self,
        account: &Account,
        agent_id: &str,
    ) -> Result<(), AuthError> {
        // Re-pairing an already-linked agent never counts against the plan.
        if self.db.is_account_agent_linked(&account.id, agent_id).await? {
            return Ok(());
        }

        if let Some(limit) = plan::agent_allowance(account, self.config.free_agent_limit) {
            let linked = self.db.count_account_agents(&account.id).await?;
            if linked >= limit {
                info!(account_id = %account.id, linked, "Plan agent limit reached");
                return Err(AuthError::FreePlanLimit);
            }
        }

        Ok(())
    }

    async fn issue_code(&self, agent_id: &str, expires_at: i64) -> Result<String, AuthError> {
        let mut attempts = 0;
        loop {
            let code = generate_pairing_code();
            match self.db.issue_pairing(agent_id, &code, expires_at).await {
                Ok(_) => return Ok(code),
                Err(e) if e.is_unique_violation() && attempts < CODE_RETRIES => {
                    attempts += 1;
                    warn!(agent_id = %agent_id, attempts, "Pairing code collision, regenerating");
                }
                Err(e) => return Err(AuthError::Internal(e.to_string())),
            }
        }
    }

    fn legacy_secret_matches(&self, secret: &str) -> bool {
        if !self.config.allow_legacy_global_agent_secret {
            return false;
        }
        match &self.config.legacy_global_agent_secret {
            Some(global) => constant_time_str_eq(secret, global),
            None => false,
        }
    }
}
