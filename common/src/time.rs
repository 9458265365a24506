//! Time utilities and constants for the balance core.

use chrono::{DateTime, Utc};

/// Engine timing and retry defaults.
pub mod constants {
    use std::time::Duration;

    /// Default timeout for a single storage call (2 seconds).
    pub fn default_storage_timeout() -> Duration {
        Duration::from_secs(2)
    }

    /// Default backoff unit between compare-and-set attempts (1 millisecond).
    pub fn default_retry_backoff() -> Duration {
        Duration::from_millis(1)
    }

    /// Default number of compare-and-set attempts per operation.
    pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 64;

    /// Default number of attempts when undoing an applied balance change.
    pub const DEFAULT_MAX_COMPENSATION_RETRIES: u32 = 256;
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_millis_u64(&self) -> u64;
}

impl DurationExt for std::time::Duration {
    fn as_millis_u64(&self) -> u64 {
        u64::try_from(self.as_millis()).unwrap_or(u64::MAX)
    }
}
