//! Ledger integrity checks.
//!
//! Every committed operation leaves a balance change and matching records, so
//! each balance must equal the sum of its account's record amounts, and the
//! two sides of all transfers together must net to zero.

use std::collections::BTreeMap;

use pocketbank_common::{AccountId, TransactionRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::Account;

/// What is wrong with an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    /// Balance differs from the sum of the account's records.
    Mismatch,
    /// Balance is below zero.
    Negative,
    /// Records reference an account that does not exist.
    OrphanRecords,
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub account_id: AccountId,
    pub balance: Decimal,
    pub ledger_sum: Decimal,
    pub kind: DiscrepancyKind,
}

/// Result of comparing balances against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Accounts examined.
    pub accounts_checked: usize,
    /// Records examined.
    pub records_checked: usize,
    /// Sum of all balances.
    pub total_balance: Decimal,
    /// Sum of all transfer record amounts; zero when every transfer is whole.
    pub transfer_imbalance: Decimal,
    /// Failed checks, ordered by account.
    pub discrepancies: Vec<Discrepancy>,
}

impl IntegrityReport {
    /// Build a report from account and record snapshots.
    pub fn build(accounts: &[Account], records: &[TransactionRecord]) -> Self {
        let mut sums: BTreeMap<&AccountId, Decimal> = BTreeMap::new();
        let mut transfer_imbalance = Decimal::ZERO;

        for record in records {
            *sums.entry(&record.account_id).or_insert(Decimal::ZERO) += record.amount;
            if record.kind.is_transfer() {
                transfer_imbalance += record.amount;
            }
        }

        let mut discrepancies = Vec::new();
        let mut total_balance = Decimal::ZERO;

        for account in accounts {
            total_balance += account.balance;
            let ledger_sum = sums.remove(&account.id).unwrap_or(Decimal::ZERO);

            if account.balance < Decimal::ZERO {
                discrepancies.push(Discrepancy {
                    account_id: account.id.clone(),
                    balance: account.balance,
                    ledger_sum,
                    kind: DiscrepancyKind::Negative,
                });
            }

            if account.balance != ledger_sum {
                discrepancies.push(Discrepancy {
                    account_id: account.id.clone(),
                    balance: account.balance,
                    ledger_sum,
                    kind: DiscrepancyKind::Mismatch,
                });
            }
        }

        // Whatever is left belongs to no known account.
        for (account_id, ledger_sum) in sums {
            discrepancies.push(Discrepancy {
                account_id: account_id.clone(),
                balance: Decimal::ZERO,
                ledger_sum,
                kind: DiscrepancyKind::OrphanRecords,
            });
        }

        discrepancies.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        Self {
            accounts_checked: accounts.len(),
            records_checked: records.len(),
            total_balance,
            transfer_imbalance,
            discrepancies,
        }
    }

    /// Check if balances and ledger agree.
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty() && self.transfer_imbalance == Decimal::ZERO
    }
}
