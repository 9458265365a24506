//! Request counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Gateway metrics.
pub struct GatewayMetrics {
    /// Requests received, including unparseable lines.
    pub requests_received: AtomicU64,
    /// Requests that completed.
    pub requests_completed: AtomicU64,
    /// Requests refused for a deterministic reason.
    pub requests_rejected: AtomicU64,
    /// Requests that hit a transient failure.
    pub requests_failed: AtomicU64,
    /// Requests currently being handled.
    pub requests_active: AtomicU64,
}

impl GatewayMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_active: AtomicU64::new(0),
        }
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.requests_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_active: self.requests_active.load(Ordering::Relaxed),
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_completed: u64,
    pub requests_rejected: u64,
    pub requests_failed: u64,
    pub requests_active: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<GatewayMetrics>;
