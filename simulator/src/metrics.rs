//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total operations attempted.
    pub total_operations: u64,
    /// Successful operations.
    pub successful_operations: u64,
    /// Failed operations.
    pub failed_operations: u64,
    /// Failures by error code.
    pub failures_by_code: BTreeMap<String, u64>,
    /// Money deposited minus money withdrawn by successful operations.
    pub net_cash: Decimal,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            failures_by_code: BTreeMap::new(),
            net_cash: Decimal::ZERO,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a successful operation and the cash it moved across the
    /// system boundary.
    pub fn record_success(&mut self, latency_ms: u64, net_cash: Decimal) {
        self.total_operations += 1;
        self.successful_operations += 1;
        self.net_cash += net_cash;
        self.record_latency(latency_ms);
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self, latency_ms: u64, code: &str) {
        self.total_operations += 1;
        self.failed_operations += 1;
        *self.failures_by_code.entry(code.to_string()).or_insert(0) += 1;
        self.record_latency(latency_ms);
    }

    fn record_latency(&mut self, latency_ms: u64) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Get failure count for an error code.
    pub fn failures(&self, code: &str) -> u64 {
        self.failures_by_code.get(code).copied().unwrap_or(0)
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get success rate.
    pub fn success_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }

        self.successful_operations as f64 / self.total_operations as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
