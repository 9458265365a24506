//! Simulation controller.

use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use pocketbank_common::{AccountId, DurationExt, LedgerError};
use pocketbank_ledger::BalanceEngine;

use crate::accounts::AccountFactory;
use crate::metrics::SimulationMetrics;
use crate::scenario::{Scenario, ScenarioStep};

/// Drives a scenario against a balance engine.
pub struct SimulationController {
    /// Engine under test.
    engine: BalanceEngine,
    /// Concurrent workers for concurrent scenarios.
    workers: usize,
    /// Prefix for account ids in this run.
    prefix: String,
    /// Accounts opened for the scenario.
    accounts: Vec<AccountId>,
    /// Sum of the seeded balances.
    seeded_total: Decimal,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(engine: BalanceEngine, workers: usize, prefix: impl Into<String>) -> Self {
        Self {
            engine,
            workers: workers.max(1),
            prefix: prefix.into(),
            accounts: Vec::new(),
            seeded_total: Decimal::ZERO,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Open and fund the scenario's accounts.
    pub async fn initialize(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!(
            accounts = scenario.account_count(),
            prefix = %self.prefix,
            "Initializing accounts"
        );

        let accounts = AccountFactory::create_accounts(&self.prefix, scenario.account_count());
        for (account, balance) in accounts.iter().zip(&scenario.initial_balances) {
            self.engine.open_account(account).await?;
            if *balance > Decimal::ZERO {
                self.engine.cash_in(account, *balance).await?;
            }
            self.seeded_total += *balance;
            debug!(account = %account, balance = %balance, "Account funded");
        }

        self.accounts = accounts;
        Ok(())
    }

    /// Run a scenario's steps.
    pub async fn run_scenario(&self, scenario: &Scenario) -> anyhow::Result<()> {
        info!(
            scenario = %scenario.name,
            description = %scenario.description,
            steps = scenario.steps.len(),
            "Running scenario"
        );

        let workers = if scenario.concurrent { self.workers } else { 1 };
        let mut queues: Vec<Vec<ScenarioStep>> = vec![Vec::new(); workers];
        for (i, step) in scenario.steps.iter().enumerate() {
            queues[i % workers].push(step.clone());
        }

        let handles: Vec<_> = queues
            .into_iter()
            .map(|queue| {
                let engine = self.engine.clone();
                let accounts = self.accounts.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    for step in &queue {
                        execute_step(&engine, &accounts, &metrics, step).await;
                    }
                })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            joined?;
        }

        Ok(())
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Check the ledger and the scenario's expectations.
    ///
    /// Returns every violation found; an empty list means the run was clean.
    pub async fn verify(&self, scenario: &Scenario) -> anyhow::Result<Vec<String>> {
        let mut violations = Vec::new();
        let metrics = self.get_metrics().await;

        let report = self.engine.verify_integrity().await?;
        for discrepancy in &report.discrepancies {
            violations.push(format!(
                "{:?} on {}: balance {} vs ledger {}",
                discrepancy.kind, discrepancy.account_id, discrepancy.balance, discrepancy.ledger_sum
            ));
        }
        if !report.transfer_imbalance.is_zero() {
            violations.push(format!(
                "transfer records net to {} instead of zero",
                report.transfer_imbalance
            ));
        }

        let mut total = Decimal::ZERO;
        for account in &self.accounts {
            let balance = self.engine.get_balance(account).await?;
            if balance < Decimal::ZERO {
                violations.push(format!("{} is negative: {}", account, balance));
            }
            total += balance;
        }
        let expected_total = self.seeded_total + metrics.net_cash;
        if total != expected_total {
            violations.push(format!(
                "money not conserved: {} held, {} expected",
                total, expected_total
            ));
        }

        if let Some(expected) = scenario.expected_successes {
            if metrics.successful_operations != expected {
                violations.push(format!(
                    "{} operations succeeded, {} expected",
                    metrics.successful_operations, expected
                ));
            }
        }

        for (code, expected) in &scenario.expected_failures {
            let actual = metrics.failures(code);
            if actual != *expected {
                violations.push(format!("{} {} failures, {} expected", actual, code, expected));
            }
        }

        for (index, expected) in &scenario.expected_balances {
            if let Some(account) = self.accounts.get(*index) {
                let balance = self.engine.get_balance(account).await?;
                if balance != *expected {
                    violations.push(format!(
                        "{} holds {}, {} expected",
                        account, balance, expected
                    ));
                }
            }
        }

        for violation in &violations {
            warn!(violation = %violation, "Invariant violated");
        }

        Ok(violations)
    }
}

/// Execute a single scenario step and record its outcome.
async fn execute_step(
    engine: &BalanceEngine,
    accounts: &[AccountId],
    metrics: &RwLock<SimulationMetrics>,
    step: &ScenarioStep,
) {
    let started = Instant::now();

    let result: Result<Decimal, LedgerError> = match step {
        ScenarioStep::CashIn { account, amount } => engine
            .cash_in(&accounts[*account], *amount)
            .await
            .map(|_| *amount),
        ScenarioStep::CashOut { account, amount } => engine
            .cash_out(&accounts[*account], *amount)
            .await
            .map(|_| -*amount),
        ScenarioStep::Transfer { from, to, amount } => engine
            .transfer(&accounts[*from], &accounts[*to], *amount)
            .await
            .map(|_| Decimal::ZERO),
    };

    let latency = started.elapsed().as_millis_u64();
    let mut metrics = metrics.write().await;
    match result {
        Ok(net_cash) => metrics.record_success(latency, net_cash),
        Err(e) => {
            debug!(step = ?step, code = e.error_code(), "Step failed");
            metrics.record_failure(latency, e.error_code());
        }
    }
}
