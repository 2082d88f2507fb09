//! Deterministic aggregation of ordered suspicions.
//!
//! Every correct replica sees the same suspicions in the same order, so
//! every correct replica folds them into the same graph. Per consensus
//! instance only the earliest delayed phase counts: a slow proposal makes
//! every later vote of that round late too, and those follow-on reports
//! would otherwise pile weight onto replicas that did nothing wrong.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use warden_config::AggregatorConfig;
use warden_types::{ConsensusId, ProcessId, ProtocolPhase, View};
use warden_wire::SuspicionMeasurement;

use crate::engine::Monitor;
use crate::error::MonitorError;
use crate::graph::SuspicionGraph;
use crate::instrumentation::METRICS;
use crate::lock;

/// Stores ordered suspicions and feeds them into the suspicion graph.
#[derive(Debug)]
pub struct SuspicionAggregator {
    config: AggregatorConfig,
    graph: Arc<SuspicionGraph>,
    state: Mutex<AggregatorState>,
}

#[derive(Debug, Default)]
struct AggregatorState {
    rounds: BTreeMap<ConsensusId, RoundEntry>,
    last_decay_consensus_id: ConsensusId,
    decay_steps_applied: u64,
    /// Instances below this were collected; their measurements are refused.
    low_water: Option<ConsensusId>,
}

/// Suspicions about one consensus instance.
#[derive(Debug, Default)]
struct RoundEntry {
    /// Only non-empty groups are stored.
    phases: BTreeMap<ProtocolPhase, BTreeSet<SuspicionMeasurement>>,
    /// Measurements already fed to the graph.
    applied: BTreeSet<SuspicionMeasurement>,
}

impl SuspicionAggregator {
    pub fn new(graph: Arc<SuspicionGraph>, config: AggregatorConfig) -> Self {
        Self {
            config,
            graph,
            state: Mutex::new(AggregatorState::default()),
        }
    }

    pub fn graph(&self) -> &Arc<SuspicionGraph> {
        &self.graph
    }

    /// Stores suspicions delivered in `consensus_id`.
    ///
    /// Each measurement is filed under its *own* consensus id and phase.
    /// Duplicates are ignored, and so are measurements of instances already
    /// garbage collected. Returns how many were new.
    pub fn on_consensus_delivered(
        &self,
        consensus_id: ConsensusId,
        measurements: impl IntoIterator<Item = SuspicionMeasurement>,
    ) -> usize {
        let mut state = lock(&self.state);
        let mut stored = 0;
        for measurement in measurements {
            if state.low_water.is_some_and(|low| measurement.consensus_id < low) {
                debug!(%consensus_id, %measurement, "suspicion for collected instance, ignoring");
                continue;
            }
            let inserted = state
                .rounds
                .entry(measurement.consensus_id)
                .or_default()
                .phases
                .entry(measurement.phase)
                .or_default()
                .insert(measurement);
            if inserted {
                stored += 1;
            }
        }
        debug!(%consensus_id, stored, "stored delivered suspicions");
        stored
    }

    /// Feeds every not-yet-applied measurement of each instance's earliest
    /// phase group into the graph. Returns how many were fed.
    ///
    /// Calling this twice without new deliveries adds nothing.
    pub fn build_suspicion_graph(&self) -> usize {
        let pending: Vec<SuspicionMeasurement> = {
            let mut state = lock(&self.state);
            let mut pending = Vec::new();
            for entry in state.rounds.values_mut() {
                let Some(earliest) = entry.phases.values().next() else {
                    continue;
                };
                let fresh: Vec<_> = earliest.difference(&entry.applied).copied().collect();
                entry.applied.extend(fresh.iter().copied());
                pending.extend(fresh);
            }
            pending
        };

        if pending.is_empty() {
            return 0;
        }
        let applied = self.graph.populate(&pending);
        debug!(fed = pending.len(), applied, "built suspicion graph");
        pending.len()
    }

    /// Decays the graph once at least `decay_interval` instances have passed
    /// since the previous decay. Returns true if a decay step ran.
    pub fn decay(&self, consensus_id: ConsensusId) -> bool {
        let strength = {
            let mut state = lock(&self.state);
            let elapsed = consensus_id.since(state.last_decay_consensus_id);
            if elapsed < self.config.decay_interval {
                return false;
            }
            state.last_decay_consensus_id = consensus_id;
            state.decay_steps_applied += 1;
            self.config.decay_rate * f64::from(elapsed)
        };

        METRICS.increment_decay_steps();
        debug!(%consensus_id, strength, "decaying suspicions");
        self.graph.remove_suspicions(strength);
        true
    }

    /// Drops stored measurements of instances below `low_water`. The graph
    /// is untouched. Returns how many measurements were dropped.
    ///
    /// Later deliveries for those instances are ignored.
    pub fn garbage_collect(&self, low_water: ConsensusId) -> usize {
        let mut state = lock(&self.state);
        state.low_water = Some(state.low_water.map_or(low_water, |low| low.max(low_water)));
        let kept = state.rounds.split_off(&low_water);
        let dropped = std::mem::replace(&mut state.rounds, kept);
        let count: usize = dropped.values().map(RoundEntry::len).sum();
        if count > 0 {
            METRICS.add_measurements_collected(count as u64);
            debug!(%low_water, count, "collected stored suspicions");
        }
        count
    }

    /// Forgets everything and resizes the graph for `view`.
    pub fn reset(&self, view: View) {
        *lock(&self.state) = AggregatorState::default();
        self.graph.resize(view);
    }

    /// All stored measurements in total order.
    pub fn measurements(&self) -> Vec<SuspicionMeasurement> {
        let state = lock(&self.state);
        let mut all: Vec<_> = state
            .rounds
            .values()
            .flat_map(|entry| entry.phases.values().flatten().copied())
            .collect();
        all.sort_unstable();
        all
    }

    /// Number of stored measurements.
    pub fn len(&self) -> usize {
        lock(&self.state).rounds.values().map(RoundEntry::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).rounds.is_empty()
    }

    pub fn last_decay_consensus_id(&self) -> ConsensusId {
        lock(&self.state).last_decay_consensus_id
    }

    pub fn decay_steps_applied(&self) -> u64 {
        lock(&self.state).decay_steps_applied
    }
}

impl RoundEntry {
    fn len(&self) -> usize {
        self.phases.values().map(BTreeSet::len).sum()
    }
}

impl Monitor for SuspicionAggregator {
    fn notify(&self, sender: ProcessId, payload: &[u8], consensus_id: ConsensusId) {
        match SuspicionMeasurement::decode(payload, sender) {
            Ok(measurement) => {
                self.on_consensus_delivered(consensus_id, [measurement]);
            }
            Err(e) => {
                METRICS.increment_decode_failures();
                let error = MonitorError::from(e);
                warn!(%sender, %consensus_id, %error, "dropping suspicion payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use warden_config::GraphConfig;
    use warden_types::SuspicionKind;

    fn pid(id: u32) -> ProcessId {
        ProcessId::new(id)
    }

    fn cid(id: i32) -> ConsensusId {
        ConsensusId::new(id)
    }

    fn aggregator(n: usize, f: usize) -> SuspicionAggregator {
        let view = View::new(n, f).unwrap();
        let graph = Arc::new(SuspicionGraph::new(view, GraphConfig::default()));
        SuspicionAggregator::new(graph, AggregatorConfig::default())
    }

    fn slow(suspect: u32, reporter: u32, phase: ProtocolPhase, consensus: i32) -> SuspicionMeasurement {
        SuspicionMeasurement::slow(pid(suspect), pid(reporter), phase, cid(consensus))
    }

    #[test]
    fn duplicates_are_stored_once() {
        let agg = aggregator(4, 1);
        let s = slow(1, 0, ProtocolPhase::Write, 3);
        assert_eq!(agg.on_consensus_delivered(cid(4), [s, s]), 1);
        assert_eq!(agg.on_consensus_delivered(cid(5), [s]), 0);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.measurements(), vec![s]);
    }

    #[test]
    fn only_earliest_phase_reaches_graph() {
        let agg = aggregator(4, 1);
        agg.on_consensus_delivered(
            cid(8),
            [
                slow(1, 0, ProtocolPhase::Propose, 7),
                slow(2, 0, ProtocolPhase::Write, 7),
                slow(3, 0, ProtocolPhase::Accept, 7),
            ],
        );
        assert_eq!(agg.build_suspicion_graph(), 1);
        let graph = agg.graph();
        assert!(graph.exists_edge(pid(0), pid(1)));
        assert!(!graph.exists_edge(pid(0), pid(2)));
        assert!(!graph.exists_edge(pid(0), pid(3)));
    }

    #[test]
    fn build_is_idempotent() {
        let agg = aggregator(4, 1);
        agg.on_consensus_delivered(
            cid(2),
            [slow(1, 0, ProtocolPhase::Write, 1), slow(1, 2, ProtocolPhase::Write, 1)],
        );
        assert_eq!(agg.build_suspicion_graph(), 2);
        let before = agg.graph().edges();
        assert_eq!(agg.build_suspicion_graph(), 0);
        assert_eq!(agg.graph().edges(), before);
    }

    #[test]
    fn new_member_of_applied_group_is_fed_alone() {
        let agg = aggregator(4, 1);
        agg.on_consensus_delivered(cid(2), [slow(1, 0, ProtocolPhase::Write, 1)]);
        agg.build_suspicion_graph();
        agg.on_consensus_delivered(cid(3), [slow(1, 2, ProtocolPhase::Write, 1)]);
        assert_eq!(agg.build_suspicion_graph(), 1);
        assert_eq!(agg.graph().edge_weight(pid(0), pid(1)), Some(1.0));
        assert_eq!(agg.graph().edge_weight(pid(2), pid(1)), Some(1.0));
    }

    #[test]
    fn late_earlier_phase_is_applied_too() {
        let agg = aggregator(4, 1);
        agg.on_consensus_delivered(cid(2), [slow(2, 0, ProtocolPhase::Accept, 1)]);
        agg.build_suspicion_graph();
        agg.on_consensus_delivered(cid(3), [slow(3, 1, ProtocolPhase::Propose, 1)]);
        assert_eq!(agg.build_suspicion_graph(), 1);
        assert!(agg.graph().exists_edge(pid(0), pid(2)));
        assert!(agg.graph().exists_edge(pid(1), pid(3)));
    }

    #[test]
    fn garbage_collect_keeps_graph() {
        let agg = aggregator(4, 1);
        for consensus in [10, 99, 100, 150] {
            agg.on_consensus_delivered(cid(consensus), [slow(1, 0, ProtocolPhase::Write, consensus)]);
        }
        agg.build_suspicion_graph();
        let weight = agg.graph().edge_weight(pid(0), pid(1));

        assert_eq!(agg.garbage_collect(cid(100)), 2);
        let remaining: Vec<_> = agg.measurements().iter().map(|m| m.consensus_id).collect();
        assert_eq!(remaining, vec![cid(100), cid(150)]);
        assert_eq!(agg.graph().edge_weight(pid(0), pid(1)), weight);
    }

    #[test]
    fn collected_instance_is_not_applied_again() {
        let agg = aggregator(4, 1);
        let s = slow(1, 0, ProtocolPhase::Propose, 10);
        agg.on_consensus_delivered(cid(11), [s]);
        agg.build_suspicion_graph();
        assert_eq!(agg.graph().edge_weight(pid(0), pid(1)), Some(1.0));

        agg.garbage_collect(cid(100));
        assert_eq!(agg.on_consensus_delivered(cid(101), [s]), 0);
        assert_eq!(agg.build_suspicion_graph(), 0);
        assert_eq!(agg.graph().edge_weight(pid(0), pid(1)), Some(1.0));

        // A lower watermark later does not reopen collected instances.
        agg.garbage_collect(cid(50));
        assert_eq!(agg.on_consensus_delivered(cid(102), [s]), 0);
        assert_eq!(agg.on_consensus_delivered(cid(102), [slow(1, 0, ProtocolPhase::Propose, 100)]), 1);
    }

    #[test]
    fn decay_waits_for_interval() {
        let agg = aggregator(4, 1);
        for _ in 0..3 {
            agg.graph().add_suspicion(pid(0), pid(1));
        }

        assert!(!agg.decay(cid(99)));
        assert_eq!(agg.decay_steps_applied(), 0);

        assert!(agg.decay(cid(100)));
        assert_eq!(agg.decay_steps_applied(), 1);
        assert_eq!(agg.last_decay_consensus_id(), cid(100));
        // 3.0 - 0.1 * 100 drops the edge.
        assert_eq!(agg.graph().edge_count(), 0);

        assert!(!agg.decay(cid(150)));
        assert!(agg.decay(cid(200)));
        assert_eq!(agg.decay_steps_applied(), 2);
    }

    #[test]
    fn notify_decodes_with_sender_as_reporter() {
        let agg = aggregator(4, 1);
        let sent = SuspicionMeasurement::new(
            pid(2),
            pid(9),
            SuspicionKind::FalseAccusation,
            ProtocolPhase::Write,
            cid(5),
        );
        agg.notify(pid(1), &sent.encode(), cid(6));
        agg.notify(pid(1), &[1, 2, 3], cid(6));

        let stored = agg.measurements();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].reporter, pid(1));
        assert_eq!(stored[0].kind, SuspicionKind::FalseAccusation);
    }

    #[test]
    fn reset_clears_store_and_graph() {
        let agg = aggregator(4, 1);
        agg.on_consensus_delivered(cid(2), [slow(1, 0, ProtocolPhase::Write, 1)]);
        agg.build_suspicion_graph();
        agg.decay(cid(200));
        agg.garbage_collect(cid(100));

        agg.reset(View::new(7, 2).unwrap());
        assert!(agg.is_empty());
        assert_eq!(agg.decay_steps_applied(), 0);
        assert_eq!(agg.last_decay_consensus_id(), ConsensusId::ZERO);
        assert_eq!(agg.graph().edge_count(), 0);
        assert_eq!(agg.graph().vertex_count(), 7);

        // The collection watermark is forgotten with the rest.
        assert_eq!(agg.on_consensus_delivered(cid(3), [slow(1, 0, ProtocolPhase::Write, 1)]), 1);
    }

    fn arb_phase() -> impl Strategy<Value = ProtocolPhase> {
        prop_oneof![
            Just(ProtocolPhase::Propose),
            Just(ProtocolPhase::Write),
            Just(ProtocolPhase::Accept),
        ]
    }

    proptest! {
        /// Property: after any delivery sequence, each graph edge traces back
        /// to a measurement in the earliest phase of its instance, and weights
        /// stay positive through decay.
        #[test]
        fn prop_graph_follows_earliest_phase(
            deliveries in proptest::collection::vec(
                (0_u32..4, 0_u32..4, arb_phase(), 1_i32..300),
                0..80,
            ),
        ) {
            let agg = aggregator(4, 1);
            for (i, (suspect, reporter, phase, consensus)) in deliveries.iter().copied().enumerate() {
                let delivered = cid(i32::try_from(i).unwrap() + 1);
                agg.on_consensus_delivered(delivered, [slow(suspect, reporter, phase, consensus)]);
                agg.build_suspicion_graph();
                agg.decay(delivered);
            }
            prop_assert_eq!(agg.build_suspicion_graph(), 0);
            for (reporter, suspect, weight) in agg.graph().edges() {
                prop_assert!(weight > 0.0);
                prop_assert_ne!(reporter, suspect);
            }
        }
    }
}
