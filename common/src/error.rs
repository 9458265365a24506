//! Error types for the PocketBank balance core.

use crate::AccountId;
use thiserror::Error;

/// Main error type for balance core operations.
///
/// Validation errors are deterministic and are shown to the caller verbatim.
/// Storage errors are transient and may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Requested amount is zero, negative, or not representable.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// The acting account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// The transfer recipient does not exist.
    #[error("Recipient not found: {0}")]
    RecipientNotFound(AccountId),

    /// The transfer recipient is the sender or is malformed.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Insufficient funds.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    /// An account with this identifier already exists.
    #[error("Account already exists: {0}")]
    AccountAlreadyExists(AccountId),

    /// Request did not have the expected shape.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Storage medium failed or timed out.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Compare-and-set kept losing races until the retry budget ran out.
    #[error("Too many concurrent conflicts on {account} after {attempts} attempts")]
    TooManyConflicts { account: AccountId, attempts: u32 },

    /// Gateway is not accepting requests.
    #[error("Gateway unavailable, retry after {retry_after_ms}ms")]
    GatewayUnavailable { retry_after_ms: u64 },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl LedgerError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::StorageUnavailable(_)
                | LedgerError::TooManyConflicts { .. }
                | LedgerError::GatewayUnavailable { .. }
        )
    }

    /// Check if this error is a deterministic validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_)
                | LedgerError::AccountNotFound(_)
                | LedgerError::RecipientNotFound(_)
                | LedgerError::InvalidRecipient(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::AccountAlreadyExists(_)
                | LedgerError::InvalidRequest { .. }
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            LedgerError::GatewayUnavailable { retry_after_ms } => Some(*retry_after_ms),
            LedgerError::StorageUnavailable(_) => Some(500),
            LedgerError::TooManyConflicts { .. } => Some(50),
            _ => None,
        }
    }

    /// Get error code for caller-facing responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::RecipientNotFound(_) => "RECIPIENT_NOT_FOUND",
            LedgerError::InvalidRecipient(_) => "INVALID_RECIPIENT",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::AccountAlreadyExists(_) => "ACCOUNT_ALREADY_EXISTS",
            LedgerError::InvalidRequest { .. } => "INVALID_REQUEST",
            LedgerError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            LedgerError::TooManyConflicts { .. } => "TOO_MANY_CONFLICTS",
            LedgerError::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
            LedgerError::ConfigurationError(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for balance core operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Caller-facing rejection derived from an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionReason {
    /// Error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Field that caused rejection (if applicable).
    pub field: Option<String>,
}

impl From<&LedgerError> for RejectionReason {
    fn from(error: &LedgerError) -> Self {
        let field = match error {
            LedgerError::InvalidAmount(_) | LedgerError::InsufficientFunds { .. } => {
                Some("amount".to_string())
            }
            LedgerError::RecipientNotFound(_) | LedgerError::InvalidRecipient(_) => {
                Some("recipient".to_string())
            }
            LedgerError::InvalidRequest { field, .. } => field.clone(),
            _ => None,
        };
        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
            field,
        }
    }
}
