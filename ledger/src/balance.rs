//! Planned balance changes.

use pocketbank_common::{max_balance, AccountId, LedgerError, Result, MONEY_SCALE};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A balance change computed from one snapshot of an account.
///
/// `balance_before` is the value the change was validated against and the
/// expected value of the compare-and-set that applies it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Account affected.
    pub account_id: AccountId,
    /// Signed delta.
    pub delta: Decimal,
    /// Balance in the snapshot.
    pub balance_before: Decimal,
    /// Balance after the change.
    pub balance_after: Decimal,
}

impl BalanceChange {
    /// Plan a change against a balance snapshot.
    ///
    /// Fails with `InsufficientFunds` when the result would be negative and
    /// with `InvalidAmount` when it would not fit the store.
    pub fn plan(account_id: &AccountId, current: Decimal, delta: Decimal) -> Result<Self> {
        let mut balance_after = current
            .checked_add(delta)
            .filter(|balance| *balance <= max_balance())
            .ok_or_else(|| {
                LedgerError::InvalidAmount(format!(
                    "balance of {} would exceed the maximum of {}",
                    account_id,
                    max_balance()
                ))
            })?;
        if balance_after < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                required: (-delta).to_string(),
                available: current.to_string(),
            });
        }
        balance_after.rescale(MONEY_SCALE);

        Ok(Self {
            account_id: account_id.clone(),
            delta,
            balance_before: current,
            balance_after,
        })
    }

    /// Check if this change decreases the balance.
    pub fn is_debit(&self) -> bool {
        self.delta < Decimal::ZERO
    }
}
