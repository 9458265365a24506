//! PocketBank Gateway Binary
//!
//! Reads newline-delimited JSON requests from stdin and writes one JSON
//! response per line to stdout. Logs go to stderr.

use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pocketbank_gateway::{GatewayConfig, LogFormat, OperationGateway};
use pocketbank_ledger::{open_stores, BalanceEngine};

fn init_tracing(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    init_tracing(&config);

    info!("Starting PocketBank gateway");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let (accounts, ledger) = open_stores(&config.storage).await?;
    let engine = BalanceEngine::new(accounts, ledger, config.engine.clone());
    let gateway = OperationGateway::new(engine, &config);

    gateway.start().await?;

    info!(
        storage = ?config.storage.backend,
        max_conflict_retries = config.engine.max_conflict_retries,
        "Gateway serving stdin"
    );

    tokio::select! {
        result = gateway.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            result?;
            info!("Input closed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    gateway.stop().await?;

    let snapshot = gateway.metrics();
    info!(
        received = snapshot.requests_received,
        completed = snapshot.requests_completed,
        rejected = snapshot.requests_rejected,
        failed = snapshot.requests_failed,
        "Gateway shutdown complete"
    );
    Ok(())
}
