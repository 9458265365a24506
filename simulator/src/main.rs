//! PocketBank Simulator
//!
//! Drives concurrent workloads against the balance engine and checks that
//! balances, records and totals still agree afterwards.

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pocketbank_common::RequestId;
use pocketbank_ledger::{open_stores, BalanceEngine, EngineConfig, StorageConfig};

mod accounts;
mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::{Scenario, ScenarioKind};

/// PocketBank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "PocketBank concurrent workload simulator")]
struct Args {
    /// Number of accounts for generated workloads
    #[arg(short, long, default_value = "8")]
    accounts: usize,

    /// Concurrent workers
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Operations to generate
    #[arg(short, long, default_value = "1000")]
    operations: usize,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "random")]
    scenario: ScenarioKind,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let engine_config = EngineConfig::from_env();
    let storage_config =
        StorageConfig::from_env().map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    engine_config
        .validate()
        .and_then(|_| storage_config.validate())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let scenario = Scenario::build(args.scenario, args.accounts, args.operations, &mut rng);

    // Account ids must not collide with earlier runs on a persistent store.
    let run_id = RequestId::new().to_string();
    let prefix = format!("sim{}", &run_id[run_id.len() - 8..]);

    info!(
        scenario = %scenario.name,
        accounts = scenario.account_count(),
        workers = args.workers,
        operations = scenario.steps.len(),
        storage = ?storage_config.backend,
        "Starting PocketBank simulator"
    );

    let (accounts, ledger) = open_stores(&storage_config).await?;
    let engine = BalanceEngine::new(accounts, ledger, engine_config);

    let mut controller = SimulationController::new(engine, args.workers, prefix);
    controller.initialize(&scenario).await?;
    controller.run_scenario(&scenario).await?;

    let metrics = controller.get_metrics().await;
    info!(
        total = metrics.total_operations,
        successful = metrics.successful_operations,
        failed = metrics.failed_operations,
        success_rate = metrics.success_rate(),
        avg_latency_ms = metrics.average_latency_ms(),
        p50_latency_ms = metrics.p50_latency_ms(),
        p99_latency_ms = metrics.p99_latency_ms(),
        "Simulation complete"
    );
    for (code, count) in &metrics.failures_by_code {
        info!(code = %code, count, "Failures");
    }

    let violations = controller.verify(&scenario).await?;
    if !violations.is_empty() {
        error!(violations = violations.len(), "Simulation found invariant violations");
        anyhow::bail!("{} invariant violations", violations.len());
    }

    info!("All invariants hold");
    Ok(())
}
