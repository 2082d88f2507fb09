//! Production instrumentation for suspicion monitoring.
//!
//! Lock-free counters and gauges covering the whole pipeline:
//!
//! - **Emission**: suspicions, false-accusation replies and latency vectors
//!   this replica submitted for ordering
//! - **Aggregation**: suspicions applied to the graph, decode failures,
//!   decay steps, latency matrix re-initialisations
//! - **Selection**: candidate sets computed, exhaustive searches that ran
//!   out of budget, current edge count
//!
//! ## Usage
//!
//! ```ignore
//! use warden_monitor::instrumentation::METRICS;
//!
//! METRICS.increment_decode_failures();
//! let snapshot = METRICS.snapshot();
//! ```
//!
//! The instance is process-wide. When several replicas share a process (as
//! in tests and the simulator) the counters aggregate across all of them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ============================================================================
// Production Metrics (Always Available)
// ============================================================================

/// Global metrics instance for the monitor.
pub static METRICS: Metrics = Metrics::new();

/// Counters and gauges for the monitor.
///
/// All metrics use relaxed atomics; they are observability, not state.
#[derive(Debug)]
pub struct Metrics {
    // === Emission Counters ===
    /// SLOW suspicions submitted by local sensors
    suspicions_emitted: AtomicU64,
    /// FALSE_ACCUSATION replies submitted
    false_accusations_emitted: AtomicU64,
    /// Latency vectors submitted
    latency_vectors_emitted: AtomicU64,

    // === Aggregation Counters ===
    /// Measurements fed into the suspicion graph
    suspicions_applied: AtomicU64,
    /// Delivered payloads that failed to decode
    decode_failures: AtomicU64,
    /// Latency matrices re-initialised after a dimension mismatch
    configuration_resets: AtomicU64,
    /// Decay steps applied to the graph
    decay_steps: AtomicU64,
    /// Stored measurements dropped by garbage collection
    measurements_collected: AtomicU64,

    // === Selection ===
    candidate_sets_computed: AtomicU64,
    exhaustive_timeouts: AtomicU64,

    // === Gauges ===
    /// Edges in the most recently mutated graph
    edge_count: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new metrics instance.
    ///
    /// This is a const function for static initialization.
    pub const fn new() -> Self {
        Self {
            suspicions_emitted: AtomicU64::new(0),
            false_accusations_emitted: AtomicU64::new(0),
            latency_vectors_emitted: AtomicU64::new(0),
            suspicions_applied: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            configuration_resets: AtomicU64::new(0),
            decay_steps: AtomicU64::new(0),
            measurements_collected: AtomicU64::new(0),
            candidate_sets_computed: AtomicU64::new(0),
            exhaustive_timeouts: AtomicU64::new(0),
            edge_count: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Counter Updates
    // ========================================================================

    pub fn increment_suspicions_emitted(&self) {
        self.suspicions_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_false_accusations_emitted(&self) {
        self.false_accusations_emitted
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_latency_vectors_emitted(&self) {
        self.latency_vectors_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_suspicions_applied(&self, count: u64) {
        self.suspicions_applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_decode_failures(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_configuration_resets(&self) {
        self.configuration_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_decay_steps(&self) {
        self.decay_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_measurements_collected(&self, count: u64) {
        self.measurements_collected
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_candidate_sets_computed(&self) {
        self.candidate_sets_computed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_exhaustive_timeouts(&self) {
        self.exhaustive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    // ========================================================================
    // Gauge Updates
    // ========================================================================

    pub fn set_edge_count(&self, count: u64) {
        self.edge_count.store(count, Ordering::Relaxed);
    }

    // ========================================================================
    // Metric Export
    // ========================================================================

    /// Returns snapshot of all metrics for testing/debugging.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            suspicions_emitted: self.suspicions_emitted.load(Ordering::Relaxed),
            false_accusations_emitted: self.false_accusations_emitted.load(Ordering::Relaxed),
            latency_vectors_emitted: self.latency_vectors_emitted.load(Ordering::Relaxed),
            suspicions_applied: self.suspicions_applied.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            configuration_resets: self.configuration_resets.load(Ordering::Relaxed),
            decay_steps: self.decay_steps.load(Ordering::Relaxed),
            measurements_collected: self.measurements_collected.load(Ordering::Relaxed),
            candidate_sets_computed: self.candidate_sets_computed.load(Ordering::Relaxed),
            exhaustive_timeouts: self.exhaustive_timeouts.load(Ordering::Relaxed),
            edge_count: self.edge_count.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub suspicions_emitted: u64,
    pub false_accusations_emitted: u64,
    pub latency_vectors_emitted: u64,
    pub suspicions_applied: u64,
    pub decode_failures: u64,
    pub configuration_resets: u64,
    pub decay_steps: u64,
    pub measurements_collected: u64,
    pub candidate_sets_computed: u64,
    pub exhaustive_timeouts: u64,
    pub edge_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.increment_suspicions_emitted();
        metrics.increment_suspicions_emitted();
        metrics.add_suspicions_applied(5);
        metrics.set_edge_count(3);
        metrics.set_edge_count(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.suspicions_emitted, 2);
        assert_eq!(snapshot.suspicions_applied, 5);
        assert_eq!(snapshot.edge_count, 2);
        assert_eq!(snapshot.decode_failures, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.increment_exhaustive_timeouts();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["exhaustive_timeouts"], 1);
    }
}
