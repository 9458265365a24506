//! Storage contracts for accounts and the transaction ledger.

use std::sync::Arc;

use async_trait::async_trait;
use pocketbank_common::{
    AccountId, NewRecord, RecordBatch, RecordId, Result, TransactionRecord,
};
use rust_decimal::Decimal;
use tracing::info;

use crate::account::Account;
use crate::config::{StorageBackend, StorageConfig};
use crate::memory::{MemoryAccountStore, MemoryLedgerStore};
use crate::postgres::{self, PgAccountStore, PgLedgerStore};

/// Result of a compare-and-set attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Stored balance matched the expected value and was replaced.
    Applied,
    /// Stored balance no longer matches; nothing was written.
    Conflict,
}

/// Durable mapping from account identifier to current balance.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Get an account. Fails with `AccountNotFound`.
    async fn get(&self, id: &AccountId) -> Result<Account>;

    /// Replace the balance only if it still equals `expected`.
    async fn compare_and_set(
        &self,
        id: &AccountId,
        expected: Decimal,
        new_balance: Decimal,
    ) -> Result<CasOutcome>;

    /// Create an account. Fails with `AccountAlreadyExists`.
    async fn create(&self, id: &AccountId, initial_balance: Decimal) -> Result<Account>;

    /// Snapshot of every account, ordered by id.
    async fn list_accounts(&self) -> Result<Vec<Account>>;
}

/// Durable, append-only collection of transaction records.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append one record.
    async fn append(&self, record: NewRecord) -> Result<RecordId>;

    /// Append every record of the batch, or none of them.
    async fn append_batch(&self, batch: RecordBatch) -> Result<Vec<RecordId>>;

    /// Records owned by an account, newest first.
    async fn list_for_account(&self, id: &AccountId) -> Result<Vec<TransactionRecord>>;

    /// Every record, oldest first.
    async fn list_all(&self) -> Result<Vec<TransactionRecord>>;
}

/// Open the stores selected by the storage configuration.
pub async fn open_stores(
    config: &StorageConfig,
) -> Result<(Arc<dyn AccountStore>, Arc<dyn LedgerStore>)> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory stores");
            Ok((
                Arc::new(MemoryAccountStore::new()),
                Arc::new(MemoryLedgerStore::new()),
            ))
        }
        StorageBackend::Postgres => {
            let pool = postgres::connect(config).await?;
            postgres::migrate(&pool).await?;
            info!(
                max_connections = config.max_connections,
                "Using PostgreSQL stores"
            );
            Ok((
                Arc::new(PgAccountStore::new(pool.clone())),
                Arc::new(PgLedgerStore::new(pool)),
            ))
        }
    }
}
