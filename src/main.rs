//! Application entrypoint and state wiring.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use email_consensus_ledger::config::Config;
use email_consensus_ledger::storage::{self, LocalChain};
use email_consensus_ledger::{router, routes, AppState};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::parse();

    // 1) load the chain (genesis-only when there is no snapshot yet)
    storage::ensure_dir(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;
    let local = LocalChain::open(config.chain_path())
        .with_context(|| format!("load chain from {}", config.chain_path().display()))?;
    info!(
        blocks = local.chain().len(),
        head = %local.chain().head().hash(),
        "Ledger ready"
    );

    // 2) shared state + router
    let state = AppState::new(local, config.save_timeout());
    let app = router(state.clone());

    // 3) serve until ctrl-c
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    info!(addr = %config.listen, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    // 4) final save
    routes::persist(&state).await.context("save chain on shutdown")?;
    info!("Chain saved");
    Ok(())
}
