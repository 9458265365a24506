//! Transaction record types.
//!
//! A record describes one signed balance delta on one account. Records are
//! created exactly once per committed operation and never change afterwards.

use crate::{AccountId, Amount, RecordId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of balance change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Money deposited into the account.
    CashIn,
    /// Money withdrawn from the account.
    CashOut,
    /// Sending side of a peer-to-peer transfer.
    TransferOut,
    /// Receiving side of a peer-to-peer transfer.
    TransferIn,
}

impl TransactionKind {
    /// Check if records of this kind increase the balance.
    pub fn is_credit(&self) -> bool {
        matches!(self, TransactionKind::CashIn | TransactionKind::TransferIn)
    }

    /// Check if this kind is one side of a transfer.
    pub fn is_transfer(&self) -> bool {
        matches!(self, TransactionKind::TransferOut | TransactionKind::TransferIn)
    }

    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::CashIn => "CASH_IN",
            TransactionKind::CashOut => "CASH_OUT",
            TransactionKind::TransferOut => "TRANSFER_OUT",
            TransactionKind::TransferIn => "TRANSFER_IN",
        }
    }

    /// Parse a stable storage name.
    pub fn from_storage(name: &str) -> Option<Self> {
        match name {
            "CASH_IN" => Some(TransactionKind::CashIn),
            "CASH_OUT" => Some(TransactionKind::CashOut),
            "TRANSFER_OUT" => Some(TransactionKind::TransferOut),
            "TRANSFER_IN" => Some(TransactionKind::TransferIn),
            _ => None,
        }
    }
}

/// A record the engine wants appended; the ledger store assigns its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    /// Record kind.
    pub kind: TransactionKind,
    /// Signed amount: positive for credits, negative for debits.
    pub amount: Decimal,
    /// Commit time, assigned by the engine.
    pub timestamp: Timestamp,
    /// Owning account.
    pub account_id: AccountId,
    /// Other side of a transfer.
    pub counterparty_id: Option<AccountId>,
}

impl NewRecord {
    /// Create a cash-in record.
    pub fn cash_in(account_id: AccountId, amount: Amount, timestamp: Timestamp) -> Self {
        Self {
            kind: TransactionKind::CashIn,
            amount: amount.as_credit(),
            timestamp,
            account_id,
            counterparty_id: None,
        }
    }

    /// Create a cash-out record.
    pub fn cash_out(account_id: AccountId, amount: Amount, timestamp: Timestamp) -> Self {
        Self {
            kind: TransactionKind::CashOut,
            amount: amount.as_debit(),
            timestamp,
            account_id,
            counterparty_id: None,
        }
    }

    /// Create both sides of a transfer.
    pub fn transfer_pair(
        sender: AccountId,
        recipient: AccountId,
        amount: Amount,
        timestamp: Timestamp,
    ) -> RecordBatch {
        let outgoing = Self {
            kind: TransactionKind::TransferOut,
            amount: amount.as_debit(),
            timestamp,
            account_id: sender.clone(),
            counterparty_id: Some(recipient.clone()),
        };
        let incoming = Self {
            kind: TransactionKind::TransferIn,
            amount: amount.as_credit(),
            timestamp,
            account_id: recipient,
            counterparty_id: Some(sender),
        };
        RecordBatch {
            records: vec![outgoing, incoming],
        }
    }

    /// Check sign and counterparty agree with the kind.
    pub fn is_well_formed(&self) -> bool {
        let sign_ok = if self.kind.is_credit() {
            self.amount > Decimal::ZERO
        } else {
            self.amount < Decimal::ZERO
        };
        let counterparty_ok = match (&self.counterparty_id, self.kind.is_transfer()) {
            (Some(counterparty), true) => counterparty != &self.account_id,
            (None, false) => true,
            _ => false,
        };
        sign_ok && counterparty_ok
    }

    /// Attach the id assigned by the store.
    pub fn into_record(self, id: RecordId) -> TransactionRecord {
        TransactionRecord {
            id,
            kind: self.kind,
            amount: self.amount,
            timestamp: self.timestamp,
            account_id: self.account_id,
            counterparty_id: self.counterparty_id,
        }
    }
}

/// A committed, immutable transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Store-assigned identifier.
    pub id: RecordId,
    /// Record kind.
    pub kind: TransactionKind,
    /// Signed amount: positive for credits, negative for debits.
    pub amount: Decimal,
    /// Commit time.
    pub timestamp: Timestamp,
    /// Owning account.
    pub account_id: AccountId,
    /// Other side of a transfer.
    pub counterparty_id: Option<AccountId>,
}

/// Records that must be committed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    /// Records in the batch.
    pub records: Vec<NewRecord>,
}

impl RecordBatch {
    /// Verify the batch moves no money in or out of the system.
    pub fn is_balanced(&self) -> bool {
        self.records.iter().map(|r| r.amount).sum::<Decimal>() == Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now;
    use rust_decimal_macros::dec;

    #[test]
    fn test_cash_records_carry_sign() {
        let amount = Amount::new(dec!(50.00)).unwrap();
        let cash_in = NewRecord::cash_in(AccountId::new("alice"), amount, now());
        let cash_out = NewRecord::cash_out(AccountId::new("alice"), amount, now());

        assert_eq!(cash_in.amount, dec!(50.00));
        assert_eq!(cash_out.amount, dec!(-50.00));
        assert!(cash_in.is_well_formed());
        assert!(cash_out.is_well_formed());
    }

    #[test]
    fn test_transfer_pair_is_balanced() {
        let amount = Amount::new(dec!(150.00)).unwrap();
        let batch = NewRecord::transfer_pair(
            AccountId::new("alice"),
            AccountId::new("bob"),
            amount,
            now(),
        );

        assert_eq!(batch.records.len(), 2);
        assert!(batch.is_balanced());

        let outgoing = &batch.records[0];
        assert_eq!(outgoing.kind, TransactionKind::TransferOut);
        assert_eq!(outgoing.counterparty_id, Some(AccountId::new("bob")));
        let incoming = &batch.records[1];
        assert_eq!(incoming.kind, TransactionKind::TransferIn);
        assert_eq!(incoming.counterparty_id, Some(AccountId::new("alice")));
        assert!(batch.records.iter().all(NewRecord::is_well_formed));
    }

    #[test]
    fn test_malformed_records_detected() {
        let mut record = NewRecord::cash_in(
            AccountId::new("alice"),
            Amount::new(dec!(1)).unwrap(),
            now(),
        );
        record.amount = dec!(-1);
        assert!(!record.is_well_formed());

        record.amount = dec!(1);
        record.counterparty_id = Some(AccountId::new("bob"));
        assert!(!record.is_well_formed());
    }

    #[test]
    fn test_kind_storage_names() {
        for kind in [
            TransactionKind::CashIn,
            TransactionKind::CashOut,
            TransactionKind::TransferOut,
            TransactionKind::TransferIn,
        ] {
            assert_eq!(TransactionKind::from_storage(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::from_storage("REFUND"), None);
        assert_eq!(
            serde_json::to_string(&TransactionKind::TransferOut).unwrap(),
            "\"TRANSFER_OUT\""
        );
    }
}
