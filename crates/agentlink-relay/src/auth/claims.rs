//! JWT claims embedded in access tokens.

use serde::{Deserialize, Serialize};

/// Claims carried by an access token. The subject is the device id; the
/// routing claims bind the device to its agent and optional tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Issuer, matched on verification.
    pub iss: String,
    /// Subject (device ID).
    pub sub: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
    /// Agent the device is bound to.
    pub agent_id: String,
    /// Optional tenant scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl AccessClaims {
    pub fn device_id(&self) -> &str {
        &self.sub
    }
}
