//! Freemium plan logic and payment-provider integration.

pub mod google;
pub mod plan;
pub mod stripe;

/// Failures talking to external billing/identity providers.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Billing is not configured")]
    NotConfigured,
}
