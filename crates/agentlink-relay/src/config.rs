//! Relay configuration.
//!
//! Built-in defaults overridden by environment variables; the CLI flags in
//! `main.rs` take highest priority.

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the HTTP/WebSocket listener binds to.
    pub http_port: u16,
    /// HMAC secret for access-token signing. Required in production.
    pub jwt_secret: String,
    /// Issuer claim stamped into and required from access tokens.
    pub jwt_issuer: String,
    /// Access-token lifetime in seconds.
    pub access_ttl_secs: i64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_secs: i64,
    /// Pairing-code lifetime in seconds.
    pub pairing_ttl_secs: i64,
    /// Consumption attempts allowed per pairing code.
    pub pairing_max_attempts: i64,
    /// Pairing operations allowed per IP per rate window.
    pub pairing_rate_max: i64,
    /// Pairing rate window in seconds.
    pub pairing_rate_window_secs: i64,
    /// Hard cap on WebSocket frame and chat text size in bytes.
    pub msg_max_bytes: usize,
    /// Offline queue bound per agent.
    pub offline_queue_max: usize,
    /// Offline queue entry TTL in seconds.
    pub offline_ttl_secs: i64,
    /// Idle-socket timeout in seconds.
    pub idle_timeout_secs: i64,
    /// Application-level ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Messages allowed per connection per rate window.
    pub ws_rate_max: usize,
    /// Per-connection message rate window in seconds.
    pub ws_rate_window_secs: u64,
    /// Accept the single global agent secret when the per-agent check fails.
    pub allow_legacy_global_agent_secret: bool,
    /// The legacy global agent secret, when the fallback is enabled.
    pub legacy_global_agent_secret: Option<String>,
    /// Agents a free-plan account may pair.
    pub free_agent_limit: i64,
    /// Account-session lifetime in seconds.
    pub session_ttl_secs: i64,
    /// Payment provider API key.
    pub stripe_secret_key: Option<String>,
    /// Webhook signing secret for the payment provider.
    pub stripe_webhook_secret: Option<String>,
    /// Price id used when creating checkout sessions.
    pub stripe_price_id: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_port: 8787,
            jwt_secret: String::new(),
            jwt_issuer: "agentlink-relay".to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 2_592_000, // 30 days
            pairing_ttl_secs: 600,
            pairing_max_attempts: 5,
            pairing_rate_max: 5,
            pairing_rate_window_secs: 60,
            msg_max_bytes: 32 * 1024,
            offline_queue_max: 10,
            offline_ttl_secs: 60,
            idle_timeout_secs: 300,
            ping_interval_secs: 30,
            ws_rate_max: 60,
            ws_rate_window_secs: 60,
            allow_legacy_global_agent_secret: false,
            legacy_global_agent_secret: None,
            free_agent_limit: 1,
            session_ttl_secs: 8 * 60 * 60,
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_price_id: None,
        }
    }
}

impl RelayConfig {
    /// Load defaults and apply environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        apply_env_overrides(&mut config);
        config
    }
}

fn apply_env_overrides(config: &mut RelayConfig) {
    if let Ok(val) = std::env::var("HTTP_PORT") {
        if let Ok(n) = val.parse() {
            config.http_port = n;
        }
    }
    if let Ok(val) = std::env::var("JWT_SECRET") {
        config.jwt_secret = val;
    }
    if let Ok(val) = std::env::var("JWT_ISSUER") {
        config.jwt_issuer = val;
    }
    override_i64(&mut config.access_ttl_secs, "ACCESS_TTL_SEC");
    override_i64(&mut config.refresh_ttl_secs, "REFRESH_TTL_SEC");
    override_i64(&mut config.pairing_ttl_secs, "PAIRING_TTL_SEC");
    override_i64(&mut config.pairing_max_attempts, "PAIRING_MAX_ATTEMPTS");
    override_i64(&mut config.pairing_rate_max, "PAIRING_RATE_PER_HOUR");
    if let Ok(val) = std::env::var("MSG_MAX_BYTES") {
        if let Ok(n) = val.parse() {
            config.msg_max_bytes = n;
        }
    }
    if let Ok(val) = std::env::var("OFFLINE_QUEUE_MAX") {
        if let Ok(n) = val.parse() {
            config.offline_queue_max = n;
        }
    }
    override_i64(&mut config.offline_ttl_secs, "OFFLINE_TTL_SEC");
    override_i64(&mut config.idle_timeout_secs, "IDLE_TIMEOUT_SEC");
    if let Ok(val) = std::env::var("ALLOW_LEGACY_GLOBAL_AGENT_SECRET") {
        config.allow_legacy_global_agent_secret = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("LEGACY_GLOBAL_AGENT_SECRET") {
        if !val.is_empty() {
            config.legacy_global_agent_secret = Some(val);
        }
    }
    override_i64(&mut config.free_agent_limit, "FREE_AGENT_LIMIT");
    override_i64(&mut config.session_ttl_secs, "SESSION_TTL_SEC");
    if let Ok(val) = std::env::var("STRIPE_SECRET_KEY") {
        if !val.is_empty() {
            config.stripe_secret_key = Some(val);
        }
    }
    if let Ok(val) = std::env::var("STRIPE_WEBHOOK_SECRET") {
        if !val.is_empty() {
            config.stripe_webhook_secret = Some(val);
        }
    }
    if let Ok(val) = std::env::var("STRIPE_PRICE_ID") {
        if !val.is_empty() {
            config.stripe_price_id = Some(val);
        }
    }
}

fn override_i64(field: &mut i64, var: &str) {
    if let Ok(val) = std::env::var(var) {
        if let Ok(n) = val.parse() {
            *field = n;
        }
    }
}
