//! Seam between the monitor and the consensus engine.
//!
//! The monitor never orders anything itself. It hands encoded measurements
//! to a [`ConsensusEngine`] and later receives them back, in commit order,
//! as [`OrderedValue`]s.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};
use warden_types::{ConsensusId, MeasurementKind, ProcessId, SuspicionKind};
use warden_wire::{LatencyMeasurement, SuspicionMeasurement};

use crate::instrumentation::METRICS;
use crate::lock;

/// The consensus engine as seen by the monitor.
pub trait ConsensusEngine: Send + Sync {
    /// Submits `payload` for total-order agreement.
    fn propose(&self, payload: Bytes, kind: MeasurementKind);
}

/// A value delivered by the consensus engine.
///
/// `sender` is the authenticated origin of the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedValue {
    pub sender: ProcessId,
    pub payload: Bytes,
    pub kind: MeasurementKind,
}

impl OrderedValue {
    pub fn new(sender: ProcessId, payload: Bytes, kind: MeasurementKind) -> Self {
        Self {
            sender,
            payload,
            kind,
        }
    }
}

/// A consumer of one kind of ordered measurement.
pub trait Monitor: Send + Sync {
    /// Handles one payload sent by `sender`, ordered in `consensus_id`.
    fn notify(&self, sender: ProcessId, payload: &[u8], consensus_id: ConsensusId);
}

/// Encodes measurements and submits them to the engine.
pub struct Publisher {
    engine: Arc<dyn ConsensusEngine>,
}

impl Publisher {
    pub fn new(engine: Arc<dyn ConsensusEngine>) -> Self {
        Self { engine }
    }

    pub fn publish_suspicion(&self, suspicion: &SuspicionMeasurement) {
        match suspicion.kind {
            SuspicionKind::Slow => METRICS.increment_suspicions_emitted(),
            SuspicionKind::FalseAccusation => METRICS.increment_false_accusations_emitted(),
        }
        info!(
            suspect = %suspicion.suspect,
            reporter = %suspicion.reporter,
            kind = %suspicion.kind,
            phase = %suspicion.phase,
            consensus_id = %suspicion.consensus_id,
            "publishing suspicion"
        );
        self.engine
            .propose(suspicion.encode(), MeasurementKind::Suspicion);
    }

    pub fn publish_latency(&self, measurement: &LatencyMeasurement) {
        METRICS.increment_latency_vectors_emitted();
        debug!(n = measurement.n(), "publishing latency vector");
        self.engine
            .propose(measurement.encode(), MeasurementKind::Latency);
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

// ============================================================================
// In-memory total order
// ============================================================================

/// A trivially totally-ordered log shared by replicas in one process.
///
/// Every proposal from every replica is appended to a single queue; each
/// [`take_batch`](Self::take_batch) call cuts the queue into the next
/// consensus instance. Used by tests and the simulator.
#[derive(Debug, Default)]
pub struct InMemoryOrdering {
    pending: Mutex<Vec<OrderedValue>>,
}

impl InMemoryOrdering {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the engine handle a replica proposes through.
    pub fn engine_for(self: &Arc<Self>, sender: ProcessId) -> Arc<dyn ConsensusEngine> {
        Arc::new(Endpoint {
            sender,
            log: Arc::clone(self),
        })
    }

    /// Removes and returns every value proposed since the last batch.
    pub fn take_batch(&self) -> Vec<OrderedValue> {
        std::mem::take(&mut *lock(&self.pending))
    }

    /// Number of values waiting for the next batch.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

struct Endpoint {
    sender: ProcessId,
    log: Arc<InMemoryOrdering>,
}

impl ConsensusEngine for Endpoint {
    fn propose(&self, payload: Bytes, kind: MeasurementKind) {
        lock(&self.log.pending).push(OrderedValue::new(self.sender, payload, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_types::ProtocolPhase;

    #[test]
    fn endpoints_attribute_their_sender() {
        let ordering = InMemoryOrdering::new();
        let a = Publisher::new(ordering.engine_for(ProcessId::new(0)));
        let b = Publisher::new(ordering.engine_for(ProcessId::new(3)));

        let s = SuspicionMeasurement::slow(
            ProcessId::new(1),
            ProcessId::new(0),
            ProtocolPhase::Write,
            ConsensusId::new(4),
        );
        a.publish_suspicion(&s);
        b.publish_latency(&LatencyMeasurement::write_only(vec![1, 2, 3, 4]));
        assert_eq!(ordering.pending(), 2);

        let batch = ordering.take_batch();
        assert_eq!(ordering.pending(), 0);
        assert_eq!(batch[0].sender, ProcessId::new(0));
        assert_eq!(batch[0].kind, MeasurementKind::Suspicion);
        assert_eq!(batch[0].payload, s.encode());
        assert_eq!(batch[1].sender, ProcessId::new(3));
        assert_eq!(batch[1].kind, MeasurementKind::Latency);
    }
}
