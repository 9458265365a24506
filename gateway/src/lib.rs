//! PocketBank Operation Gateway
//!
//! The gateway is the boundary between authenticated callers and the balance
//! engine. It validates request structure, dispatches to the engine, and maps
//! engine errors to stable rejection codes.

pub mod config;
pub mod gateway;
pub mod metrics;
pub mod request;
pub mod state;

pub use config::{GatewayConfig, LogFormat};
pub use gateway::OperationGateway;
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use request::{
    CallerIdentity, Operation, OperationRequest, OperationResponse, Outcome, TransactionView,
};
pub use state::GatewayState;
