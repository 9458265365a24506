//! PostgreSQL stores.
//!
//! Balances are `NUMERIC(20,2)` with a non-negative check constraint, so the
//! database itself refuses an overdraft even if a caller skips validation.
//! Compare-and-set is a single conditional `UPDATE`; a transfer's two records
//! are inserted in one transaction.

use std::str::FromStr;

use async_trait::async_trait;
use pocketbank_common::{
    AccountId, DurationExt, LedgerError, NewRecord, RecordBatch, RecordId, Result,
    TransactionKind, TransactionRecord,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::{debug, info};

use crate::account::Account;
use crate::config::StorageConfig;
use crate::store::{AccountStore, CasOutcome, LedgerStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        balance NUMERIC(20, 2) NOT NULL CHECK (balance >= 0),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        kind TEXT NOT NULL,
        amount NUMERIC(20, 2) NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        account_id TEXT NOT NULL REFERENCES accounts (id),
        counterparty_id TEXT NULL
    )",
    "CREATE INDEX IF NOT EXISTS transactions_account_idx
        ON transactions (account_id, id DESC)",
];

fn storage_error(err: sqlx::Error) -> LedgerError {
    LedgerError::StorageUnavailable(err.to_string())
}

/// Open a connection pool.
///
/// The statement timeout is set per connection so that a write which reached
/// the server is bounded there rather than abandoned by the client.
pub async fn connect(config: &StorageConfig) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(&config.database_url)
        .map_err(|e| LedgerError::ConfigurationError(e.to_string()))?
        .options([(
            "statement_timeout",
            config.statement_timeout.as_millis_u64().to_string(),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(storage_error)?;

    info!(
        acquire_timeout_ms = config.acquire_timeout.as_millis_u64(),
        statement_timeout_ms = config.statement_timeout.as_millis_u64(),
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Create the tables if they do not exist yet.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(storage_error)?;
    }
    debug!("Schema ready");
    Ok(())
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::new(row.try_get::<String, _>("id").map_err(storage_error)?),
        balance: row.try_get("balance").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

fn record_from_row(row: &PgRow) -> Result<TransactionRecord> {
    let kind: String = row.try_get("kind").map_err(storage_error)?;
    let counterparty: Option<String> = row.try_get("counterparty_id").map_err(storage_error)?;

    Ok(TransactionRecord {
        id: record_id(row)?,
        kind: TransactionKind::from_storage(&kind).ok_or_else(|| {
            LedgerError::StorageUnavailable(format!("unknown transaction kind {}", kind))
        })?,
        amount: row.try_get("amount").map_err(storage_error)?,
        timestamp: row.try_get("timestamp").map_err(storage_error)?,
        account_id: AccountId::new(
            row.try_get::<String, _>("account_id")
                .map_err(storage_error)?,
        ),
        counterparty_id: counterparty.map(AccountId::new),
    })
}

/// Account store backed by the `accounts` table.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: &AccountId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn get(&self, id: &AccountId) -> Result<Account> {
        let row = sqlx::query(
            "SELECT id, balance, created_at, updated_at FROM accounts WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(LedgerError::AccountNotFound(id.clone())),
        }
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

        let result = sqlx::query(
            "UPDATE accounts SET balance = $3, updated_at = now()
             WHERE id = $1 AND balance = $2",
        )
        .bind(id.as_str())
        .bind(expected)
        .bind(new_balance)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 1 {
            return Ok(CasOutcome::Applied);
        }

        // Nothing matched: either the balance moved or the row is gone.
        if self.exists(id).await? {
            Ok(CasOutcome::Conflict)
        } else {
            Err(LedgerError::AccountNotFound(id.clone()))
        }
    }

    async fn create(&self, id: &AccountId, initial_balance: Decimal) -> Result<Account> {
        let row = sqlx::query(
            "INSERT INTO accounts (id, balance) VALUES ($1, $2)
             ON CONFLICT (id) DO NOTHING
             RETURNING id, balance, created_at, updated_at",
        )
        .bind(id.as_str())
        .bind(initial_balance)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(LedgerError::AccountAlreadyExists(id.clone())),
        }
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT id, balance, created_at, updated_at FROM accounts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(account_from_row).collect()
    }
}

/// Ledger store backed by the `transactions` table.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const INSERT_RECORD: &str = "INSERT INTO transactions
    (kind, amount, timestamp, account_id, counterparty_id)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id";

const SELECT_RECORDS: &str =
    "SELECT id, kind, amount, timestamp, account_id, counterparty_id FROM transactions";

fn insert_record(record: &NewRecord) -> Query<'_, Postgres, PgArguments> {
    sqlx::query(INSERT_RECORD)
        .bind(record.kind.as_str())
        .bind(record.amount)
        .bind(record.timestamp)
        .bind(record.account_id.as_str())
        .bind(record.counterparty_id.as_ref().map(AccountId::as_str))
}

fn record_id(row: &PgRow) -> Result<RecordId> {
    let id: i64 = row.try_get("id").map_err(storage_error)?;
    u64::try_from(id)
        .map(RecordId::new)
        .map_err(|_| LedgerError::StorageUnavailable(format!("record id {} out of range", id)))
}

fn malformed(record: &NewRecord) -> LedgerError {
    LedgerError::InvalidRequest {
        message: format!(
            "{} record of {} for {} is malformed",
            record.kind.as_str(),
            record.amount,
            record.account_id
        ),
        field: None,
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn append(&self, record: NewRecord) -> Result<RecordId> {
        if !record.is_well_formed() {
            return Err(malformed(&record));
        }

        let row = insert_record(&record)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        record_id(&row)
    }

    async fn append_batch(&self, batch: RecordBatch) -> Result<Vec<RecordId>> {
        if let Some(record) = batch.records.iter().find(|r| !r.is_well_formed()) {
            return Err(malformed(record));
        }
        if !batch.is_balanced() {
            return Err(LedgerError::InvalidRequest {
                message: format!("batch of {} records does not net to zero", batch.records.len()),
                field: None,
            });
        }

        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let mut ids = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let row = insert_record(record)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_error)?;
            ids.push(record_id(&row)?);
        }
        tx.commit().await.map_err(storage_error)?;

        Ok(ids)
    }

    async fn list_for_account(&self, id: &AccountId) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE account_id = $1 ORDER BY id DESC",
            SELECT_RECORDS
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_RECORDS))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(record_from_row).collect()
    }
}
