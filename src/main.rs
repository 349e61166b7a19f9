//! resell_ledger service entry point
//!
//! ```text
//! webhook ──▶ dispatcher ──▶ escrow queue ──▶ sync worker ──▶ settle queue
//!                                                                 │
//! http gateway ──▶ core services ◀── settlement worker ◀──────────┘
//! ```
//!
//! Flags: `--env <name>` picks `config/<name>.yaml` (default `dev`),
//! `--port <n>` overrides the gateway port.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use resell_ledger::config::AppConfig;
use resell_ledger::coord::{CoordinationStore, MemoryCoordStore};
use resell_ledger::db::Database;
use resell_ledger::deps::{Deps, LedgerCore};
use resell_ledger::gateway::{self, state::AppState};
use resell_ledger::store::{MemoryStore, Store};
use resell_ledger::upstream::HttpMarketplaceClient;

fn arg_value(name: &str) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1).cloned())
}

fn get_env() -> String {
    arg_value("--env").or_else(|| arg_value("-e")).unwrap_or_else(|| "dev".to_string())
}

fn get_port_override() -> Option<u16> {
    arg_value("--port").and_then(|p| p.parse().ok())
}

async fn open_storage(config: &AppConfig) -> anyhow::Result<(Arc<dyn Store>, Arc<dyn CoordinationStore>)> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url, config.postgres_pool_size).await?;
            let (store, coord) = db.open_stores().await?;
            tracing::info!("PostgreSQL connected and schema initialized");
            Ok((Arc::new(store), Arc::new(coord)))
        }
        None => {
            tracing::warn!("postgres_url not set, running on in-memory storage");
            Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryCoordStore::new())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = resell_ledger::logging::init_logging(&config);
    tracing::info!(env = %env, "Starting resell_ledger");

    let (store, coord) = open_storage(&config).await.context("Failed to open storage")?;
    let api = Arc::new(HttpMarketplaceClient::new(config.upstream.clone())?);

    let (core, ingress, workers) = LedgerCore::build(Deps { store, coord, api }, &config)?;

    let cancel = CancellationToken::new();
    let mut handles = workers.spawn(&cancel);

    let state = Arc::new(AppState::new(
        core,
        ingress,
        config.gateway.jwt_secret.clone(),
        config.gateway.web_ui_url.clone(),
    ));
    let port = get_port_override().unwrap_or(config.gateway.port);
    let addr = format!("{}:{}", config.gateway.host, port);
    let server_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = gateway::run_server(state, &addr, server_cancel.clone()).await {
            tracing::error!(error = %e, "Gateway failed");
            server_cancel.cancel();
        }
    }));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Task panicked during shutdown");
        }
    }
    tracing::info!("Stopped");
    Ok(())
}
