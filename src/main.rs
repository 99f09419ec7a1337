// =============================================================================
// Signal Relay Engine — Main Entry Point
// =============================================================================
//
// Wires together persistence, credentials, the exchange adapter registry,
// the HTTP surfaces (webhook ingress + admin API), and the two background
// loops (exit monitor, scheduler) behind one `Arc<AppState>`.

mod api;
mod app_state;
mod broadcast;
mod cache;
mod config;
mod credentials;
mod db;
mod errors;
mod exchange;
mod execution;
mod exit;
mod ingress;
mod notifications;
mod risk;
mod scheduler;
mod signal_pipeline;
mod trade_tracker;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, ExchangeRegistry};
use crate::config::RuntimeConfig;
use crate::credentials::CredentialStore;
use crate::db::PersistenceGateway;
use crate::exchange::{AtomicVenueClient, ExchangeAdapter, SeparateCallVenueClient};
use crate::trade_tracker::TradeTracker;
use crate::types::Venue;

fn venue_base_url(venue: Venue) -> String {
    let env_key = match venue {
        Venue::A => "VENUE_A_BASE_URL",
        Venue::B => "VENUE_B_BASE_URL",
        Venue::C => "VENUE_C_BASE_URL",
        Venue::D => "VENUE_D_BASE_URL",
    };
    std::env::var(env_key).unwrap_or_else(|_| format!("https://{}.example.com", venue.to_string().to_lowercase()))
}

async fn build_exchange_registry(db: &PersistenceGateway, credentials: &CredentialStore) -> anyhow::Result<ExchangeRegistry> {
    let mut registry = ExchangeRegistry::new();
    let accounts = db.list_active_exchange_accounts().await?;

    for account in accounts {
        let creds = match credentials.decode(&account.credentials) {
            Ok(c) => c,
            Err(e) => {
                warn!(account_id = %account.id, venue = %account.venue, error = %e, "skipping account with undecodable credentials");
                continue;
            }
        };
        let base_url = venue_base_url(account.venue);

        let adapter: Arc<dyn ExchangeAdapter> = match account.venue {
            Venue::A => Arc::new(AtomicVenueClient::new(creds.api_key, creds.api_secret, base_url)),
            other => Arc::new(SeparateCallVenueClient::new(other, creds.api_key, creds.api_secret, base_url)),
        };
        registry.register(adapter);
        info!(venue = %account.venue, account_id = %account.id, "exchange adapter registered");
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("signal relay engine starting up");

    let config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://engine.db".to_string());
    let db = PersistenceGateway::connect(&database_url).await?;

    let credentials = CredentialStore::new();
    let exchange_registry = build_exchange_registry(&db, &credentials).await?;

    let state = Arc::new(AppState::new(config, db, credentials, exchange_registry));
    let tracker = Arc::new(TradeTracker::new());

    // ── HTTP surfaces ────────────────────────────────────────────────────
    let router = ingress::router().merge(api::rest::router()).with_state(state.clone());
    let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "http server listening");

    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "http server exited");
        }
    });

    // ── Background loops ────────────────────────────────────────────────
    let monitor_state = state.clone();
    let monitor_tracker = tracker.clone();
    let monitor_task = tokio::spawn(async move {
        exit::monitor::run_exit_monitor(monitor_state, monitor_tracker).await;
    });

    let scheduler_state = state.clone();
    let scheduler_tracker = tracker.clone();
    let scheduler_task = tokio::spawn(async move {
        scheduler::run_scheduler(scheduler_state, scheduler_tracker).await;
    });

    info!("all subsystems running; press ctrl+c to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    server_task.abort();
    monitor_task.abort();
    scheduler_task.abort();

    if let Err(e) = state.config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("signal relay engine shut down complete");
    Ok(())
}
