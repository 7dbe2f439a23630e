//! Agent-secret hashing and constant-time verification.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Digest an agent secret, salted with the agent id so identical secrets
/// across agents produce distinct hashes.
pub fn hash_agent_secret(agent_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent_id.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a presented secret against the stored digest in constant time.
pub fn verify_agent_secret(agent_id: &str, secret: &str, stored_hash: &str) -> bool {
    let computed = hash_agent_secret(agent_id, secret);
    constant_time_str_eq(&computed, stored_hash)
}

/// Constant-time string comparison.
///
/// Length differences return early, which is fine: digest strings have a
/// fixed length, so only the content comparison carries secrets.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_salted_by_agent_id() {
        let h1 = hash_agent_secret("a1", "secret");
        let h2 = hash_agent_secret("a2", "secret");
        assert_ne!(h1, h2);
    }

    #[test]
    fn verify_roundtrip() {
        let stored = hash_agent_secret("a1", "secret");
        assert!(verify_agent_secret("a1", "secret", &stored));
        assert!(!verify_agent_secret("a1", "wrong", &stored));
        assert!(!verify_agent_secret("a2", "secret", &stored));
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_str_eq("hello", "hello"));
        assert!(constant_time_str_eq("", ""));
        assert!(!constant_time_str_eq("hello", "hellp"));
        assert!(!constant_time_str_eq("short", "longer-string"));
    }
}
