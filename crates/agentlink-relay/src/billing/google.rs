//! Google sign-in: resolve an OAuth access token to a verified email.

use serde::Deserialize;

use super::BillingError;

const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

/// The subset of the userinfo response the relay cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleUserInfo {
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// Resolve a Google OAuth access token via the userinfo endpoint.
pub async fn resolve_user(
    http: &reqwest::Client,
    access_token: &str,
) -> Result<GoogleUserInfo, BillingError> {
    let response = http
        .get(USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(BillingError::Provider(format!(
            "userinfo returned {}",
            response.status()
        )));
    }

    let info: GoogleUserInfo = response.json().await?;
    if info.email.is_empty() {
        return Err(BillingError::Provider("userinfo had no email".to_string()));
    }

    Ok(info)
}
