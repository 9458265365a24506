//! Account definitions for the ledger.

use chrono::{DateTime, Utc};
use pocketbank_common::{zero_balance, AccountId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A ledger account and its current balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Current balance, never negative.
    pub balance: Decimal,
    /// When the account was opened.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open a new account with a zero balance.
    pub fn open(id: AccountId) -> Self {
        Self::with_balance(id, zero_balance())
    }

    /// Create an account with the given starting balance.
    pub fn with_balance(id: AccountId, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if account has sufficient funds for a debit.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_account_starts_at_zero() {
        let account = Account::open(AccountId::new("alice"));
        assert_eq!(account.balance, Decimal::ZERO);
        assert_eq!(account.balance.to_string(), "0.00");
        assert_eq!(account.created_at, account.updated_at);
    }

    #[test]
    fn test_sufficient_funds_is_inclusive() {
        let account = Account::with_balance(AccountId::new("alice"), dec!(100.00));
        assert!(account.has_sufficient_funds(dec!(100.00)));
        assert!(!account.has_sufficient_funds(dec!(100.01)));
    }
}
