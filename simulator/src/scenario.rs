//! Simulation scenarios.

use std::collections::BTreeMap;

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Many concurrent cash-outs racing for one balance.
    DrainRace,
    /// Concurrent transfers in both directions between random pairs.
    TransferStorm,
    /// Deposit, transfer everything, then overdraw by a cent.
    Walkthrough,
    /// Random mix of every operation.
    Random,
}

/// One balance mutation, addressing accounts by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioStep {
    CashIn { account: usize, amount: Decimal },
    CashOut { account: usize, amount: Decimal },
    Transfer { from: usize, to: usize, amount: Decimal },
}

/// A workload and what must hold after it.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Starting balance per account; its length is the account count.
    pub initial_balances: Vec<Decimal>,
    /// Spread steps over concurrent workers, or run them in order.
    pub concurrent: bool,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
    /// Required number of successful steps.
    pub expected_successes: Option<u64>,
    /// Required failure counts by error code.
    pub expected_failures: BTreeMap<String, u64>,
    /// Required final balances by account index.
    pub expected_balances: Vec<(usize, Decimal)>,
}

fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

impl Scenario {
    /// Build a scenario.
    pub fn build(kind: ScenarioKind, accounts: usize, operations: usize, rng: &mut StdRng) -> Self {
        match kind {
            ScenarioKind::DrainRace => Self::drain_race(operations),
            ScenarioKind::TransferStorm => Self::transfer_storm(accounts.max(2), operations, rng),
            ScenarioKind::Walkthrough => Self::walkthrough(),
            ScenarioKind::Random => Self::random(accounts.max(2), operations, rng),
        }
    }

    /// `operations` cash-outs of 5.00 against a balance covering half of them.
    fn drain_race(operations: usize) -> Self {
        let amount = cents(500);
        let covered = operations / 2;
        let mut expected_failures = BTreeMap::new();
        if operations > covered {
            expected_failures.insert(
                "INSUFFICIENT_FUNDS".to_string(),
                (operations - covered) as u64,
            );
        }

        Self {
            name: "drain-race".to_string(),
            description: format!(
                "{} concurrent cash-outs of {} against a balance covering {}",
                operations, amount, covered
            ),
            initial_balances: vec![amount * Decimal::from(covered as u64)],
            concurrent: true,
            steps: (0..operations)
                .map(|_| ScenarioStep::CashOut { account: 0, amount })
                .collect(),
            expected_successes: Some(covered as u64),
            expected_failures,
            expected_balances: vec![(0, Decimal::ZERO)],
        }
    }

    /// Random transfers, half of them reversing the direction of the other.
    fn transfer_storm(accounts: usize, operations: usize, rng: &mut StdRng) -> Self {
        let steps = (0..operations)
            .map(|i| {
                let a = rng.gen_range(0..accounts);
                let mut b = rng.gen_range(0..accounts);
                while b == a {
                    b = rng.gen_range(0..accounts);
                }
                let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
                ScenarioStep::Transfer {
                    from,
                    to,
                    amount: cents(rng.gen_range(1..=1_000)),
                }
            })
            .collect();

        Self {
            name: "transfer-storm".to_string(),
            description: format!(
                "{} concurrent transfers across {} accounts",
                operations, accounts
            ),
            initial_balances: vec![cents(100_000); accounts],
            concurrent: true,
            steps,
            expected_successes: None,
            expected_failures: BTreeMap::new(),
            expected_balances: Vec::new(),
        }
    }

    /// Deposit 50.00 onto 100.00, send all 150.00, then try to withdraw 0.01.
    fn walkthrough() -> Self {
        let mut expected_failures = BTreeMap::new();
        expected_failures.insert("INSUFFICIENT_FUNDS".to_string(), 1);

        Self {
            name: "walkthrough".to_string(),
            description: "Cash-in, full transfer, and an overdraft attempt".to_string(),
            initial_balances: vec![cents(10_000), Decimal::ZERO],
            concurrent: false,
            steps: vec![
                ScenarioStep::CashIn {
                    account: 0,
                    amount: cents(5_000),
                },
                ScenarioStep::Transfer {
                    from: 0,
                    to: 1,
                    amount: cents(15_000),
                },
                ScenarioStep::CashOut {
                    account: 0,
                    amount: cents(1),
                },
            ],
            expected_successes: Some(2),
            expected_failures,
            expected_balances: vec![(0, Decimal::ZERO), (1, cents(15_000))],
        }
    }

    /// Random cash-ins, cash-outs and transfers.
    fn random(accounts: usize, operations: usize, rng: &mut StdRng) -> Self {
        let steps = (0..operations)
            .map(|_| {
                let account = rng.gen_range(0..accounts);
                let amount = cents(rng.gen_range(1..=5_000));
                match rng.gen_range(0..3) {
                    0 => ScenarioStep::CashIn { account, amount },
                    1 => ScenarioStep::CashOut { account, amount },
                    _ => ScenarioStep::Transfer {
                        from: account,
                        to: rng.gen_range(0..accounts),
                        amount,
                    },
                }
            })
            .collect();

        Self {
            name: "random".to_string(),
            description: format!("{} random operations across {} accounts", operations, accounts),
            initial_balances: vec![cents(100_000); accounts],
            concurrent: true,
            steps,
            expected_successes: None,
            expected_failures: BTreeMap::new(),
            expected_balances: Vec::new(),
        }
    }

    /// Number of accounts the scenario uses.
    pub fn account_count(&self) -> usize {
        self.initial_balances.len()
    }
}
