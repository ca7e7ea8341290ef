//! Manylla Relay Server
//!
//! A self-hostable relay for zero-knowledge profile sync. The relay stores
//! only opaque ciphertexts keyed by sync id, plus invite and share routing
//! records. It never sees recovery phrases, keys or plaintext.

mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod storage;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "manylla-relay", about = "Manylla zero-knowledge sync relay")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("{} not found, using default settings", cli.config.display());
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }

    cfg.validate()?;

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let state = server::AppState::new(storage, &cfg);
    let cleanup = cleanup::spawn_cleanup_task(
        state.storage.clone(),
        vec![state.sync_limiter.clone(), state.share_limiter.clone()],
        Duration::from_secs(cfg.cleanup_interval_secs),
    );
    let app = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    tracing::info!(
        "Manylla relay listening on {} (store: {})",
        listener.local_addr()?,
        cfg.storage_path.display()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.abort();
    tracing::info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
