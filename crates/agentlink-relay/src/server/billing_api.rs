//! Account auth, plan introspection, and billing callbacks.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use agentlink_core::unix_timestamp;

use crate::billing::stripe::{apply_event, WebhookEvent};
use crate::billing::{google, BillingError};
use crate::protocol::ErrorCode;
use crate::storage::Account;

use super::error::ApiError;
use super::ws_common::bearer_token;
use super::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_RETURN_URL: &str = "https://app.agentlink.dev/billing";

/// Account fields exposed over the API. Provider ids stay server-side.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: String,
    pub email: String,
    pub provider: String,
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<String>,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            email: account.email,
            provider: account.provider,
            plan: account.plan,
            subscription_status: account.subscription_status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_token: String,
    pub account: AccountView,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct GoogleAuthBody {
    pub google_access_token: String,
}

/// `POST /api/billing/auth/google` — sign in with a Google OAuth token.
pub async fn auth_google(
    State(state): State<AppState>,
    Json(body): Json<GoogleAuthBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    let user = google::resolve_user(&state.http, &body.google_access_token)
        .await
        .map_err(|e| match e {
            BillingError::Provider(_) => {
                ApiError::new(ErrorCode::InvalidCredentials, "google token rejected")
            }
            other => ApiError::from(other),
        })?;

    let (token, account, expires_at) = state
        .authority
        .open_account_session(&user.email, "google")
        .await?;

    Ok(Json(SessionResponse {
        session_token: token,
        account: account.into(),
        expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChromeProfileBody {
    pub email: String,
    #[serde(default)]
    pub chrome_profile_id: Option<String>,
}

/// `POST /api/billing/auth/chrome-profile` — sign in with the browser
/// profile identity the extension already holds.
pub async fn auth_chrome_profile(
    State(state): State<AppState>,
    Json(body): Json<ChromeProfileBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    if body.email.is_empty() || !body.email.contains('@') {
        return Err(ApiError::new(
            ErrorCode::InvalidCredentials,
            "a valid email is required",
        ));
    }

    let (token, account, expires_at) = state
        .authority
        .open_account_session(&body.email, "chrome-profile")
        .await?;

    Ok(Json(SessionResponse {
        session_token: token,
        account: account.into(),
        expires_at,
    }))
}

async fn session_account(state: &AppState, headers: &HeaderMap) -> Result<Account, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(ApiError::unauthorized());
    };
    Ok(state.authority.resolve_session(token).await?)
}

/// `GET /api/billing/me` — the signed-in account and its linked agents.
pub async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let account = session_account(&state, &headers).await?;
    let agent_ids = state.db.list_account_agents(&account.id).await?;

    Ok(Json(json!({
        "account": AccountView::from(account),
        "agent_ids": agent_ids,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SyncAgentsBody {
    pub agent_ids: Vec<String>,
}

/// `POST /api/billing/sync-agents` — replace the account's agent links
/// with the set the extension currently holds.
pub async fn sync_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SyncAgentsBody>,
) -> Result<Json<Value>, ApiError> {
    let account = session_account(&state, &headers).await?;

    state
        .db
        .replace_account_agents(&account.id, &body.agent_ids)
        .await?;
    let linked = state.db.count_account_agents(&account.id).await?;

    Ok(Json(json!({ "linked": linked })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutBody {
    #[serde(default)]
    pub return_url: Option<String>,
}

/// `POST /api/billing/checkout` — create a hosted checkout session.
pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<Value>, ApiError> {
    let account = session_account(&state, &headers).await?;

    let (Some(provider), Some(price_id)) =
        (state.provider.as_ref(), state.config.stripe_price_id.as_deref())
    else {
        return Err(ApiError::internal(BillingError::NotConfigured));
    };

    let return_url = body.return_url.as_deref().unwrap_or(DEFAULT_RETURN_URL);
    let url = provider
        .create_checkout_session(&account.id, &account.email, price_id, return_url)
        .await?;

    Ok(Json(json!({ "url": url })))
}

/// `POST /api/billing/portal` — open the billing portal for a paying
/// customer.
pub async fn portal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Result<Json<Value>, ApiError> {
    let account = session_account(&state, &headers).await?;

    let Some(provider) = state.provider.as_ref() else {
        return Err(ApiError::internal(BillingError::NotConfigured));
    };
    let Some(customer_id) = account.stripe_customer_id.as_deref() else {
        return Err(ApiError::new(
            ErrorCode::InvalidMessage,
            "account has no billing profile",
        ));
    };

    let return_url = body.return_url.as_deref().unwrap_or(DEFAULT_RETURN_URL);
    let url = provider.create_portal_session(customer_id, return_url).await?;

    Ok(Json(json!({ "url": url })))
}

/// `POST /api/billing/webhook/stripe` — verified webhook ingestion.
/// Signature failures return 401 and change no state.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let Some(verifier) = state.webhooks.as_ref() else {
        warn!("Webhook received but no signing secret is configured");
        return Err(ApiError::unauthorized());
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    if let Err(e) = verifier.verify(signature, &body, unix_timestamp()) {
        warn!(error = %e, "Webhook signature rejected");
        return Err(ApiError::unauthorized());
    }

    let event: WebhookEvent = serde_json::from_str(&body)
        .map_err(|_| ApiError::new(ErrorCode::InvalidMessage, "unparseable webhook body"))?;

    let updated = apply_event(&state.db, &event).await?;
    Ok(Json(json!({ "received": true, "updated": updated })))
}
