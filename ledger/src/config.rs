//! Engine and storage configuration.

use std::str::FromStr;
use std::time::Duration;

use pocketbank_common::constants;

/// Balance engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to each storage read and account creation.
    pub storage_timeout: Duration,
    /// Compare-and-set attempts per operation before `TooManyConflicts`.
    pub max_conflict_retries: u32,
    /// Attempts to undo an applied balance change.
    pub max_compensation_retries: u32,
    /// Backoff unit between attempts, multiplied by the attempt number.
    pub retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_timeout: constants::default_storage_timeout(),
            max_conflict_retries: constants::DEFAULT_MAX_CONFLICT_RETRIES,
            max_compensation_retries: constants::DEFAULT_MAX_COMPENSATION_RETRIES,
            retry_backoff: constants::default_retry_backoff(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("POCKETBANK_STORAGE_TIMEOUT_MS") {
            config.storage_timeout = Duration::from_millis(ms);
        }

        if let Some(retries) = env_parse("POCKETBANK_MAX_CONFLICT_RETRIES") {
            config.max_conflict_retries = retries;
        }

        if let Some(retries) = env_parse("POCKETBANK_MAX_COMPENSATION_RETRIES") {
            config.max_compensation_retries = retries;
        }

        if let Some(ms) = env_parse::<u64>("POCKETBANK_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(ms);
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage_timeout.is_zero() {
            return Err("Storage timeout cannot be 0".to_string());
        }

        if self.max_conflict_retries == 0 {
            return Err("Conflict retries must be at least 1".to_string());
        }

        if self.max_compensation_retries < self.max_conflict_retries {
            return Err("Compensation retries cannot be lower than conflict retries".to_string());
        }

        Ok(())
    }
}

/// Storage medium behind the account and ledger stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Process-local maps, for tests and the simulator.
    Memory,
    /// PostgreSQL through a sqlx pool.
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            other => Err(format!("Unknown storage backend: {}", other)),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Selected backend.
    pub backend: StorageBackend,
    /// Database URL (postgres backend only).
    pub database_url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Server-side limit on a single statement.
    pub statement_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: "postgres://localhost/pocketbank".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(3),
            statement_timeout: Duration::from_secs(5),
        }
    }
}

impl StorageConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(backend) = std::env::var("POCKETBANK_STORAGE") {
            config.backend = backend.parse()?;
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }

        if let Some(max) = env_parse("POCKETBANK_DB_MAX_CONNECTIONS") {
            config.max_connections = max;
        }

        if let Some(ms) = env_parse::<u64>("POCKETBANK_DB_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("POCKETBANK_DB_STATEMENT_TIMEOUT_MS") {
            config.statement_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == StorageBackend::Postgres {
            if self.database_url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.max_connections == 0 {
                return Err("Connection pool needs at least one connection".to_string());
            }
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
