//! PocketBank Ledger
//!
//! Account balances, the append-only transaction ledger, and the balance
//! engine that mutates both with optimistic compare-and-set.

pub mod account;
pub mod balance;
pub mod config;
pub mod engine;
pub mod integrity;
pub mod memory;
pub mod postgres;
pub mod store;

pub use account::Account;
pub use balance::BalanceChange;
pub use config::{EngineConfig, StorageBackend, StorageConfig};
pub use engine::{BalanceEngine, TransferRecords};
pub use integrity::{Discrepancy, DiscrepancyKind, IntegrityReport};
pub use memory::{MemoryAccountStore, MemoryLedgerStore};
pub use postgres::{PgAccountStore, PgLedgerStore};
pub use store::{open_stores, AccountStore, CasOutcome, LedgerStore};
