//! In-memory stores.
//!
//! Used by tests and the simulator. Compare-and-set holds the account's map
//! entry exclusively for the duration of the comparison and write, so two
//! callers can never both observe a match.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use pocketbank_common::{
    AccountId, LedgerError, NewRecord, RecordBatch, RecordId, Result, TransactionRecord,
};
use rust_decimal::Decimal;

use crate::account::Account;
use crate::store::{AccountStore, CasOutcome, LedgerStore};

/// Thread-safe account store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<AccountId, Account>,
}

impl MemoryAccountStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn get(&self, id: &AccountId) -> Result<Account> {
        self.accounts
            .get(id)
            .map(|account| account.clone())
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))
    }

    async fn compare_and_set(
        &self,
        id: &AccountId,
        expected: Decimal,
        new_balance: Decimal,
    ) -> Result<CasOutcome> {
        if new_balance < Decimal::ZERO {
            return Err(LedgerError::InvalidRequest {
                message: format!("balance of {} cannot become negative", id),
                field: Some("balance".to_string()),
            });
        }

        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.clone()))?;

        if account.balance != expected {
            return Ok(CasOutcome::Conflict);
        }

        account.balance = new_balance;
        account.updated_at = Utc::now();
        Ok(CasOutcome::Applied)
    }

    async fn create(&self, id: &AccountId, initial_balance: Decimal) -> Result<Account> {
        match self.accounts.entry(id.clone()) {
            Entry::Occupied(_) => Err(LedgerError::AccountAlreadyExists(id.clone())),
            Entry::Vacant(slot) => {
                let account = Account::with_balance(id.clone(), initial_balance);
                slot.insert(account.clone());
                Ok(account)
            }
        }
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.accounts.iter().map(|a| a.clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }
}

/// Append-only ledger held in memory.
#[derive(Default)]
pub struct MemoryLedgerStore {
    records: RwLock<Vec<TransactionRecord>>,
    next_id: AtomicU64,
}

impl MemoryLedgerStore {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check(record: &NewRecord) -> Result<()> {
        if record.is_well_formed() {
            Ok(())
        } else {
            Err(LedgerError::InvalidRequest {
                message: format!(
                    "{} record of {} for {} is malformed",
                    record.kind.as_str(),
                    record.amount,
                    record.account_id
                ),
                field: None,
            })
        }
    }

    fn push(&self, records: &mut Vec<TransactionRecord>, record: NewRecord) -> RecordId {
        // Ids are taken while the write lock is held so that id order and
        // append order agree.
        let id = RecordId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        records.push(record.into_record(id));
        id
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, record: NewRecord) -> Result<RecordId> {
        Self::check(&record)?;
        let mut records = self.records.write();
        Ok(self.push(&mut records, record))
    }

    async fn append_batch(&self, batch: RecordBatch) -> Result<Vec<RecordId>> {
        for record in &batch.records {
            Self::check(record)?;
        }
        if !batch.is_balanced() {
            return Err(LedgerError::InvalidRequest {
                message: format!("batch of {} records does not net to zero", batch.records.len()),
                field: None,
            });
        }
        let mut records = self.records.write();
        Ok(batch
            .records
            .into_iter()
            .map(|record| self.push(&mut records, record))
            .collect())
    }

    async fn list_for_account(&self, id: &AccountId) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .records
            .read()
            .iter()
            .rev()
            .filter(|record| &record.account_id == id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.records.read().clone())
    }
}
