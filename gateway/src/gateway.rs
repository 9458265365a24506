//! Operation gateway.
//!
//! Translates caller requests into balance engine calls and engine results
//! into responses. Only structural checks happen here: the amount must parse
//! as a positive decimal and the recipient must be a well-formed id. Every
//! monetary rule is enforced by the engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pocketbank_common::{AccountId, Amount, LedgerError, Result};
use pocketbank_ledger::BalanceEngine;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::config::GatewayConfig;
use crate::metrics::{GatewayMetrics, MetricsSnapshot, SharedMetrics};
use crate::request::{Operation, OperationRequest, OperationResponse, Outcome, TransactionView};
use crate::state::GatewayState;

/// Retry hint returned while the gateway is not running.
const UNAVAILABLE_RETRY_MS: u64 = 1000;

/// How long `stop` waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Front door to the balance engine.
pub struct OperationGateway {
    /// Engine shared by all requests.
    engine: BalanceEngine,
    /// Current lifecycle state.
    state: Arc<RwLock<GatewayState>>,
    /// Request counters.
    metrics: SharedMetrics,
    /// Largest accepted request line.
    max_request_bytes: usize,
}

impl OperationGateway {
    /// Create a gateway in the `Starting` state.
    pub fn new(engine: BalanceEngine, config: &GatewayConfig) -> Self {
        Self {
            engine,
            state: Arc::new(RwLock::new(GatewayState::Starting)),
            metrics: Arc::new(GatewayMetrics::new()),
            max_request_bytes: config.max_request_bytes,
        }
    }

    /// Start accepting requests.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        *self.state.write() = GatewayState::Running;
        info!("Gateway running");
        Ok(())
    }

    /// Refuse new requests and wait for in-flight ones to finish.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping gateway");
        *self.state.write() = GatewayState::ShuttingDown;

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                let active = self.metrics.requests_active.load(Ordering::Relaxed);
                if active == 0 {
                    break;
                }
                debug!(active, "Waiting for in-flight requests");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!("In-flight requests still running at shutdown");
        }

        *self.state.write() = GatewayState::Stopped;
        info!("Gateway stopped");
        Ok(())
    }

    /// Get the current gateway state.
    pub fn state(&self) -> GatewayState {
        *self.state.read()
    }

    /// Check if the gateway is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Get current metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Handle one request.
    #[instrument(
        skip(self, request),
        fields(request_id = %request.request_id, operation = request.operation.name())
    )]
    pub async fn handle(&self, request: OperationRequest) -> OperationResponse {
        self.metrics.request_received();
        let request_id = request.request_id;

        match self.dispatch(request).await {
            Ok(outcome) => {
                self.metrics.request_completed();
                debug!("Request completed");
                OperationResponse::Completed {
                    request_id: Some(request_id),
                    outcome,
                }
            }
            Err(e) => {
                if e.is_validation() {
                    self.metrics.request_rejected();
                    warn!(code = e.error_code(), error = %e, "Request rejected");
                } else {
                    self.metrics.request_failed();
                    warn!(code = e.error_code(), error = %e, "Request failed");
                }
                OperationResponse::rejected(Some(request_id), &e)
            }
        }
    }

    /// Handle one JSON-encoded request line.
    pub async fn handle_line(&self, line: &str) -> OperationResponse {
        let parsed = if line.len() > self.max_request_bytes {
            Err(LedgerError::InvalidRequest {
                message: format!("request exceeds {} bytes", self.max_request_bytes),
                field: None,
            })
        } else {
            serde_json::from_str::<OperationRequest>(line).map_err(|e| {
                LedgerError::InvalidRequest {
                    message: format!("malformed request: {}", e),
                    field: None,
                }
            })
        };

        match parsed {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                self.metrics.request_received();
                self.metrics.request_rejected();
                warn!(error = %e, "Unreadable request");
                OperationResponse::rejected(None, &e)
            }
        }
    }

    /// Serve newline-delimited JSON requests until the input ends or the
    /// gateway stops. Each response is written as one line.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = self.handle_line(&line).await;
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;

            if self.state().is_terminal() {
                break;
            }
        }

        Ok(())
    }

    async fn dispatch(&self, request: OperationRequest) -> Result<Outcome> {
        if !self.is_accepting_requests() {
            return Err(LedgerError::GatewayUnavailable {
                retry_after_ms: UNAVAILABLE_RETRY_MS,
            });
        }

        let caller = request.caller.account_id;
        if !caller.is_valid() {
            return Err(LedgerError::InvalidRequest {
                message: format!("malformed caller id {:?}", caller.as_str()),
                field: Some("caller".to_string()),
            });
        }

        let engine = match request.timeout_ms {
            Some(0) => {
                return Err(LedgerError::InvalidRequest {
                    message: "timeout must be positive".to_string(),
                    field: Some("timeout_ms".to_string()),
                })
            }
            Some(ms) => self.engine.with_storage_timeout(Duration::from_millis(ms)),
            None => self.engine.clone(),
        };

        match request.operation {
            Operation::OpenAccount => {
                let account = engine.open_account(&caller).await?;
                Ok(Outcome::Account {
                    account_id: account.id,
                    balance: account.balance,
                    created_at: account.created_at,
                })
            }
            Operation::CashIn { amount } => {
                let amount = Amount::parse(&amount)?;
                let record = engine.cash_in(&caller, amount.value()).await?;
                Ok(Outcome::Recorded {
                    records: vec![record],
                })
            }
            Operation::CashOut { amount } => {
                let amount = Amount::parse(&amount)?;
                let record = engine.cash_out(&caller, amount.value()).await?;
                Ok(Outcome::Recorded {
                    records: vec![record],
                })
            }
            Operation::Transfer { recipient, amount } => {
                let amount = Amount::parse(&amount)?;
                let recipient = AccountId::new(recipient.trim());
                if !recipient.is_valid() {
                    return Err(LedgerError::InvalidRecipient(format!(
                        "malformed recipient id {:?}",
                        recipient.as_str()
                    )));
                }
                let transfer = engine.transfer(&caller, &recipient, amount.value()).await?;
                Ok(Outcome::Recorded {
                    records: vec![transfer.outgoing, transfer.incoming],
                })
            }
            Operation::GetBalance => {
                let balance = engine.get_balance(&caller).await?;
                Ok(Outcome::Balance {
                    account_id: caller,
                    balance,
                })
            }
            Operation::ListTransactions => {
                let records = engine.list_transactions(&caller).await?;
                Ok(Outcome::History {
                    transactions: records.iter().map(TransactionView::from).collect(),
                })
            }
        }
    }
}
