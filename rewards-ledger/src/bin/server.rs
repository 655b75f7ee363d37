//! Rewards ledger server binary

use anyhow::Context;
use rewards_ledger::{http, Config, RewardsEngine};
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("REWARDS_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            config.apply_env()?;
            Ok(config)
        }
        Err(_) => Ok(Config::from_env()?),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
    }
    tracing::info!("Shutting down rewards ledger server");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!("Starting rewards ledger server");

    let engine = RewardsEngine::open(config).context("Failed to open rewards engine")?;
    tracing::info!(
        data_dir = ?engine.config().data_dir,
        milestones = engine.config().streak.milestones.len(),
        "Rewards engine ready"
    );

    let addr = engine.config().metrics_listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", addr))?;

    http::serve(engine, listener, shutdown_signal()).await
}
