//! HTTP and WebSocket endpoints for the relay.

pub mod agent_ws;
pub mod billing_api;
pub mod client_ws;
pub mod error;
pub mod health;
pub mod http_api;
pub mod ws_common;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};

use crate::auth::{CredentialAuthority, TokenManager};
use crate::billing::stripe::{ProviderClient, WebhookVerifier};
use crate::buffer::OfflineQueue;
use crate::config::RelayConfig;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::storage::RelayDatabase;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: RelayDatabase,
    pub config: Arc<RelayConfig>,
    pub authority: CredentialAuthority,
    pub router: Arc<Router>,
    pub webhooks: Option<WebhookVerifier>,
    pub provider: Option<ProviderClient>,
    pub http: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the relay components together over an opened database.
    pub fn new(db: RelayDatabase, config: Arc<RelayConfig>) -> Self {
        let tokens = Arc::new(TokenManager::new(
            config.jwt_secret.as_bytes(),
            &config.jwt_issuer,
            config.access_ttl_secs,
        ));
        let authority = CredentialAuthority::new(db.clone(), tokens, Arc::clone(&config));

        let queue = Arc::new(OfflineQueue::new(
            config.offline_queue_max,
            config.offline_ttl_secs,
        ));
        let router = Arc::new(Router::new(
            ConnectionRegistry::new(),
            queue,
            db.clone(),
            Arc::clone(&config),
        ));

        let http = reqwest::Client::new();
        let webhooks = config
            .stripe_webhook_secret
            .as_deref()
            .map(WebhookVerifier::new);
        let provider = config
            .stripe_secret_key
            .as_deref()
            .map(|key| ProviderClient::new(http.clone(), key));

        Self {
            db,
            config,
            authority,
            router,
            webhooks,
            provider,
            http,
            started_at: Instant::now(),
        }
    }
}

/// Build the axum application with every route mounted.
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health::health))
        .route("/api/pair/start", post(http_api::pair_start))
        .route("/api/pair/complete", post(http_api::pair_complete))
        .route("/api/token/refresh", post(http_api::token_refresh))
        .route("/api/token/revoke", post(http_api::token_revoke))
        .route("/api/agents", get(http_api::list_agents))
        .route("/api/billing/auth/google", post(billing_api::auth_google))
        .route(
            "/api/billing/auth/chrome-profile",
            post(billing_api::auth_chrome_profile),
        )
        .route("/api/billing/me", get(billing_api::me))
        .route("/api/billing/sync-agents", post(billing_api::sync_agents))
        .route("/api/billing/checkout", post(billing_api::checkout))
        .route("/api/billing/portal", post(billing_api::portal))
        .route("/api/billing/webhook/stripe", post(billing_api::stripe_webhook))
        .route("/ws/agent", get(agent_ws::upgrade))
        .route("/ws/client", get(client_ws::upgrade))
        .with_state(state)
}
