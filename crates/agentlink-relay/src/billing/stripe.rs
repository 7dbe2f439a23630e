//! Payment-provider integration: webhook verification, plan transitions,
//! and the checkout/portal API client.
//!
//! The provider signs webhooks with `HMAC-SHA256(secret, "<t>.<body>")`
//! carried in a `t=<unix>,v1=<hex>` header.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use agentlink_core::db::DatabaseError;

use crate::auth::secret::constant_time_str_eq;
use crate::billing::plan::PRO_ACTIVE_STATUSES;
use crate::storage::RelayDatabase;

use super::BillingError;

type HmacSha256 = Hmac<Sha256>;

/// Reject webhooks whose timestamp is further than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const PROVIDER_API_BASE: &str = "https://api.stripe.com/v1";

/// Webhook signature failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Malformed signature header")]
    MalformedHeader,

    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Signature mismatch")]
    Mismatch,
}

/// Verifies webhook signatures against the shared signing secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify a `t=<unix>,v1=<hex>` header against the raw body.
    pub fn verify(&self, header: &str, body: &str, now: i64) -> Result<(), WebhookError> {
        let (timestamp, signature) = parse_signature_header(header)?;

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(WebhookError::StaleTimestamp);
        }

        let expected = sign_payload(&self.secret, timestamp, body);
        if constant_time_str_eq(&expected, &signature) {
            Ok(())
        } else {
            Err(WebhookError::Mismatch)
        }
    }
}

/// Compute the hex signature for a timestamped payload.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    // HMAC-SHA256 accepts keys of any length, so this cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn parse_signature_header(header: &str) -> Result<(i64, String), WebhookError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(v1)) => Ok((t, v1)),
        _ => Err(WebhookError::MalformedHeader),
    }
}

/// A webhook event, decoded just far enough to drive plan transitions.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: WebhookObject,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
}

/// Apply a verified webhook event to account billing state. Returns
/// whether any account was updated.
pub async fn apply_event(
    db: &RelayDatabase,
    event: &WebhookEvent,
) -> Result<bool, DatabaseError> {
    let object = &event.data.object;

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let Some(account_id) = object.client_reference_id.as_deref() else {
                warn!("Checkout completed without client_reference_id");
                return Ok(false);
            };

            db.update_account_billing(
                account_id,
                object.customer.as_deref(),
                object.subscription.as_deref(),
                "pro",
                Some("active"),
            )
            .await?;

            info!(account_id = %account_id, "Checkout completed, plan upgraded");
            Ok(true)
        }

        "customer.subscription.updated" | "customer.subscription.deleted" => {
            let Some(customer) = object.customer.as_deref() else {
                warn!(event_type = %event.event_type, "Subscription event without customer");
                return Ok(false);
            };

            let Some(account) = db.find_account_by_customer(customer).await? else {
                warn!(customer = %customer, "Subscription event for unknown customer");
                return Ok(false);
            };

            let status = match event.event_type.as_str() {
                "customer.subscription.deleted" => "canceled".to_string(),
                _ => object.status.clone().unwrap_or_else(|| "canceled".to_string()),
            };
            let plan = if PRO_ACTIVE_STATUSES.contains(&status.as_str()) {
                "pro"
            } else {
                "free"
            };

            db.update_account_billing(
                &account.id,
                Some(customer),
                object.id.as_deref(),
                plan,
                Some(&status),
            )
            .await?;

            info!(account_id = %account.id, plan = %plan, status = %status, "Subscription state applied");
            Ok(true)
        }

        other => {
            // Unhandled event types are acknowledged without state change.
            info!(event_type = %other, "Ignoring webhook event");
            Ok(false)
        }
    }
}

/// Minimal client for the provider's checkout and billing-portal APIs.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct HostedSession {
    url: String,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, secret_key: impl Into<String>) -> Self {
        Self {
            http,
            secret_key: secret_key.into(),
        }
    }

    /// Create a checkout session for upgrading an account; returns the
    /// hosted payment page URL.
    pub async fn create_checkout_session(
        &self,
        account_id: &str,
        email: &str,
        price_id: &str,
        return_url: &str,
    ) -> Result<String, BillingError> {
        let params = [
            ("mode", "subscription"),
            ("client_reference_id", account_id),
            ("customer_email", email),
            ("line_items[0][price]", price_id),
            ("line_items[0][quantity]", "1"),
            ("success_url", return_url),
            ("cancel_url", return_url),
        ];

        let response = self
            .http
            .post(format!("{PROVIDER_API_BASE}/checkout/sessions"))
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await?;

        Self::session_url(response).await
    }

    /// Create a billing-portal session for an existing customer.
    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, BillingError> {
        let params = [("customer", customer_id), ("return_url", return_url)];

        let response = self
            .http
            .post(format!("{PROVIDER_API_BASE}/billing_portal/sessions"))
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await?;

        Self::session_url(response).await
    }

    async fn session_url(response: reqwest::Response) -> Result<String, BillingError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Provider API call failed");
            return Err(BillingError::Provider(format!(
                "provider returned {status}: {body}"
            )));
        }

        let session: HostedSession = response.json().await?;
        Ok(session.url)
    }
}

#[cfg(test)]
mod tests {
    use agentlink_core::unix_timestamp;

    use super::*;

    fn signed_header(secret: &str, body: &str, ts: i64) -> String {
        format!("t={ts},v1={}", sign_payload(secret, ts, body))
    }

    #[test]
    fn valid_signature_passes() {
        let verifier = WebhookVerifier::new("whsec_test");
        let body = r#"{"type":"checkout.session.completed"}"#;
        let now = unix_timestamp();

        let header = signed_header("whsec_test", body, now);
        assert!(verifier.verify(&header, body, now).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = unix_timestamp();

        let header = signed_header("whsec_test", "original", now);
        assert!(matches!(
            verifier.verify(&header, "tampered", now),
            Err(WebhookError::Mismatch)
        ));
    }

    #[test]
    fn wrong_secret_fails() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = unix_timestamp();

        let header = signed_header("whsec_other", "body", now);
        assert!(matches!(
            verifier.verify(&header, "body", now),
            Err(WebhookError::Mismatch)
        ));
    }

    #[test]
    fn stale_timestamp_fails() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = unix_timestamp();

        let header = signed_header("whsec_test", "body", now - 3600);
        assert!(matches!(
            verifier.verify(&header, "body", now),
            Err(WebhookError::StaleTimestamp)
        ));
    }

    #[test]
    fn malformed_header_fails() {
        let verifier = WebhookVerifier::new("whsec_test");
        let now = unix_timestamp();

        for header in ["", "t=abc,v1=00", "v1=00", "t=123"] {
            assert!(matches!(
                verifier.verify(header, "body", now),
                Err(WebhookError::MalformedHeader)
            ));
        }
    }

    #[tokio::test]
    async fn checkout_event_upgrades_account() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        db.create_account("acc1", "a@example.com", "google")
            .await
            .unwrap();

        let event: WebhookEvent = serde_json::from_str(
            r#"{"type":"checkout.session.completed","data":{"object":{"id":"cs_1","customer":"cus_1","subscription":"sub_1","client_reference_id":"acc1"}}}"#,
        )
        .unwrap();

        assert!(apply_event(&db, &event).await.unwrap());

        let account = db.get_account("acc1").await.unwrap();
        assert_eq!(account.plan, "pro");
        assert_eq!(account.subscription_status.as_deref(), Some("active"));
        assert_eq!(account.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(account.stripe_subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn subscription_deleted_downgrades_account() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        db.create_account("acc1", "a@example.com", "google")
            .await
            .unwrap();
        db.update_account_billing("acc1", Some("cus_1"), Some("sub_1"), "pro", Some("active"))
            .await
            .unwrap();

        let event: WebhookEvent = serde_json::from_str(
            r#"{"type":"customer.subscription.deleted","data":{"object":{"id":"sub_1","customer":"cus_1"}}}"#,
        )
        .unwrap();

        assert!(apply_event(&db, &event).await.unwrap());

        let account = db.get_account("acc1").await.unwrap();
        assert_eq!(account.plan, "free");
        assert_eq!(account.subscription_status.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn subscription_updated_follows_status() {
        let db = RelayDatabase::open_in_memory().await.unwrap();
        db.create_account("acc1", "a@example.com", "google")
            .await
            .unwrap();
        db.update_account_billing("acc1", Some("cus_1"), None, "free", None)
            .await
            .unwrap();

        let event: WebhookEvent = serde_json::from_str(
            r#"{"type":"customer.subscription.updated","data":{"object":{"id":"sub_1","customer":"cus_1","status":"past_due"}}}"#,
        )
        .unwrap();
        assert!(apply_event(&db, &event).await.unwrap());
        assert_eq!(db.get_account("acc1").await.unwrap().plan, "pro");

        let event: WebhookEvent = serde_json::from_str(
            r#"{"type":"customer.subscription.updated","data":{"object":{"id":"sub_1","customer":"cus_1","status":"unpaid"}}}"#,
        )
        .unwrap();
        assert!(apply_event(&db, &event).await.unwrap());
        assert_eq!(db.get_account("acc1").await.unwrap().plan, "free");
    }

    #[tokio::test]
    async fn unknown_event_is_ignored() {
        let db = RelayDatabase::open_in_memory().await.unwrap();

        let event: WebhookEvent = serde_json::from_str(
            r#"{"type":"invoice.paid","data":{"object":{"id":"in_1"}}}"#,
        )
        .unwrap();

        assert!(!apply_event(&db, &event).await.unwrap());
    }
}
