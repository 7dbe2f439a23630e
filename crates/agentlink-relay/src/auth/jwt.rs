//! Access-token issuance and validation.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};

use agentlink_core::unix_timestamp;

use super::claims::AccessClaims;

/// Manages access-token creation and validation.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_ttl_secs: i64,
}

impl TokenManager {
    /// Create a new `TokenManager` with the given HMAC secret and issuer.
    pub fn new(secret: &[u8], issuer: &str, access_ttl_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            access_ttl_secs,
        }
    }

    /// Issue an access token for a device. Returns the token and its TTL.
    pub fn issue_access(
        &self,
        device_id: &str,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<(String, i64), jsonwebtoken::errors::Error> {
        let now = unix_timestamp();

        let claims = AccessClaims {
            iss: self.issuer.clone(),
            sub: device_id.to_string(),
            iat: now,
            exp: now + self.access_ttl_secs,
            agent_id: agent_id.to_string(),
            tenant_id: tenant_id.map(str::to_string),
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok((token, self.access_ttl_secs))
    }

    /// Validate an access token: signature, expiry, and issuer.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Digest an opaque token for storage (raw tokens are never persisted).
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_tokens() -> TokenManager {
        TokenManager::new(b"test-secret-key-for-testing", "agentlink-test", 900)
    }

    #[test]
    fn issue_and_verify_access_token() {
        let tokens = test_tokens();
        let (token, ttl) = tokens.issue_access("d1", "a1", Some("t1")).unwrap();
        assert_eq!(ttl, 900);

        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.device_id(), "d1");
        assert_eq!(claims.agent_id, "a1");
        assert_eq!(claims.tenant_id.as_deref(), Some("t1"));
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn invalid_token_fails_verification() {
        let tokens = test_tokens();
        assert!(tokens.verify("not-a-valid-token").is_err());
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let t1 = test_tokens();
        let t2 = TokenManager::new(b"different-secret", "agentlink-test", 900);

        let (token, _) = t1.issue_access("d1", "a1", None).unwrap();
        assert!(t2.verify(&token).is_err());
    }

    #[test]
    fn issuer_mismatch_rejected() {
        let t1 = test_tokens();
        let t2 = TokenManager::new(b"test-secret-key-for-testing", "someone-else", 900);

        let (token, _) = t1.issue_access("d1", "a1", None).unwrap();
        let err = t2.verify(&token).unwrap_err();
        assert!(matches!(
            err.kind(),
            jsonwebtoken::errors::ErrorKind::InvalidIssuer
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let tokens = TokenManager::new(b"test-secret-key-for-testing", "agentlink-test", -120);
        let (token, _) = tokens.issue_access("d1", "a1", None).unwrap();

        let err = tokens.verify(&token).unwrap_err();
        assert!(matches!(
            err.kind(),
            jsonwebtoken::errors::ErrorKind::ExpiredSignature
        ));
    }

    #[test]
    fn token_hash_is_deterministic() {
        let h1 = TokenManager::hash_token("same-token");
        let h2 = TokenManager::hash_token("same-token");
        assert_eq!(h1, h2);

        let h3 = TokenManager::hash_token("different-token");
        assert_ne!(h1, h3);
    }
}
