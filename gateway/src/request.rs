//! Request and response types.
//!
//! Requests arrive already authenticated: the caller identity is trusted and
//! is the account every operation acts on. Amounts travel as decimal strings
//! so that no precision is lost in transit.

use chrono::{DateTime, SecondsFormat, Utc};
use pocketbank_common::{
    AccountId, LedgerError, RecordId, RejectionReason, RequestId, TransactionKind,
    TransactionRecord,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Account the caller owns.
    pub account_id: AccountId,
}

/// Operation requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Open the caller's account with a zero balance.
    OpenAccount,
    /// Deposit into the caller's account.
    CashIn { amount: String },
    /// Withdraw from the caller's account.
    CashOut { amount: String },
    /// Send money to another account.
    Transfer { recipient: String, amount: String },
    /// Current balance of the caller's account.
    GetBalance,
    /// Records of the caller's account, newest first.
    ListTransactions,
}

impl Operation {
    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::OpenAccount => "open_account",
            Operation::CashIn { .. } => "cash_in",
            Operation::CashOut { .. } => "cash_out",
            Operation::Transfer { .. } => "transfer",
            Operation::GetBalance => "get_balance",
            Operation::ListTransactions => "list_transactions",
        }
    }
}

/// A request as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Correlation id echoed in the response. Generated when absent.
    #[serde(default)]
    pub request_id: RequestId,
    /// Authenticated caller.
    pub caller: CallerIdentity,
    /// What to do.
    pub operation: Operation,
    /// Storage timeout for this request, overriding the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A record as shown in an account history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionView {
    /// Id of the underlying record.
    pub record_id: RecordId,
    /// "Cash In", "Cash Out", "Sent to <id>" or "Received from <id>".
    pub description: String,
    /// Signed amount from the viewing account's side.
    pub amount: Decimal,
    /// RFC 3339 commit time.
    pub date_time: String,
}

impl From<&TransactionRecord> for TransactionView {
    fn from(record: &TransactionRecord) -> Self {
        let counterparty = record
            .counterparty_id
            .as_ref()
            .map(AccountId::as_str)
            .unwrap_or("unknown");

        let description = match record.kind {
            TransactionKind::CashIn => "Cash In".to_string(),
            TransactionKind::CashOut => "Cash Out".to_string(),
            TransactionKind::TransferOut => format!("Sent to {}", counterparty),
            TransactionKind::TransferIn => format!("Received from {}", counterparty),
        };

        Self {
            record_id: record.id,
            description,
            amount: record.amount,
            date_time: record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Result of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Account opened.
    Account {
        account_id: AccountId,
        balance: Decimal,
        created_at: DateTime<Utc>,
    },
    /// Records written by a balance mutation.
    Recorded { records: Vec<TransactionRecord> },
    /// Current balance.
    Balance {
        account_id: AccountId,
        balance: Decimal,
    },
    /// Account history, newest first.
    History { transactions: Vec<TransactionView> },
}

/// Response written back to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationResponse {
    /// The operation took effect, or the read succeeded.
    Completed {
        request_id: Option<RequestId>,
        outcome: Outcome,
    },
    /// Nothing changed.
    Rejected {
        request_id: Option<RequestId>,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl OperationResponse {
    /// Build a rejection from an error.
    pub fn rejected(request_id: Option<RequestId>, error: &LedgerError) -> Self {
        let reason = RejectionReason::from(error);
        OperationResponse::Rejected {
            request_id,
            code: reason.code,
            message: reason.message,
            field: reason.field,
            retry_after_ms: error.retry_after_ms(),
        }
    }

    /// Check if the operation completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationResponse::Completed { .. })
    }

    /// Error code of a rejection.
    pub fn code(&self) -> Option<&str> {
        match self {
            OperationResponse::Completed { .. } => None,
            OperationResponse::Rejected { code, .. } => Some(code),
        }
    }
}
