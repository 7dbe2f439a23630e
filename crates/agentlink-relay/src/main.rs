//! AgentLink Relay Server
//!
//! Pairs browser clients with AI agents and routes chat traffic between
//! them without persisting message bodies.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use agentlink_core::tracing_init::init_tracing;
use agentlink_core::unix_timestamp;

use agentlink_relay::config::RelayConfig;
use agentlink_relay::server::{app, AppState};
use agentlink_relay::storage::RelayDatabase;

/// How often expired rows are purged from the store.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "agentlink-relay")]
#[command(version, about = "AgentLink relay server - pairs browsers with agents and routes chat")]
struct Args {
    /// Address to listen on. Overrides HTTP_PORT.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to the SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("agentlink_relay=info", args.log_json);

    let config = RelayConfig::from_env();
    if config.jwt_secret.is_empty() {
        anyhow::bail!("JWT_SECRET must be set");
    }
    let config = Arc::new(config);

    let addr = args
        .addr
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.http_port)));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        "Starting agentlink-relay"
    );

    let db_path = match args.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening relay database");
    let db = RelayDatabase::open(&db_path).await?;

    let state = AppState::new(db.clone(), Arc::clone(&config));

    // Connection registries and offline queues are process-local: they
    // start empty and peers re-establish after a restart.
    let maintenance = state.router.spawn_maintenance();
    let cleanup = spawn_cleanup(db);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Relay server ready");

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    })
    .await?;

    maintenance.abort();
    cleanup.abort();
    info!("Relay stopped");
    Ok(())
}

fn spawn_cleanup(db: RelayDatabase) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match db.cleanup(unix_timestamp()).await {
                Ok(stats) if stats.total() > 0 => {
                    info!(
                        refresh_tokens = stats.refresh_tokens,
                        pairings = stats.pairings,
                        sessions = stats.sessions,
                        rate_counters = stats.rate_counters,
                        "Expired rows cleaned up"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Cleanup pass failed"),
            }
        }
    })
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".agentlink").join("relay.db"))
}
