//! Per-replica monitor runtime.
//!
//! Wires the sensor, aggregator, graph and latency monitor of one replica
//! together and owns the periodic tasks. Constructed explicitly and shared
//! through an `Arc`; there is no global instance.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};
use warden_config::WardenConfig;
use warden_types::{ConsensusId, MeasurementKind, Nanos, ProcessId, ProtocolPhase, View};
use warden_wire::{LatencyMeasurement, SuspicionMeasurement};

use crate::aggregator::SuspicionAggregator;
use crate::clock::TimeSource;
use crate::engine::{ConsensusEngine, Monitor, OrderedValue, Publisher};
use crate::error::{MonitorError, Result};
use crate::graph::SuspicionGraph;
use crate::instrumentation::METRICS;
use crate::latency::{LatencyMonitor, LatencySensor};
use crate::lock;
use crate::sensor::SuspicionSensor;

/// The monitor of one replica.
pub struct MonitorRuntime {
    me: ProcessId,
    config: WardenConfig,
    publisher: Arc<Publisher>,
    sensor: SuspicionSensor,
    aggregator: SuspicionAggregator,
    latency: LatencyMonitor,
    propose_latencies: LatencySensor,
    write_latencies: LatencySensor,
    membership: Mutex<Membership>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Bumped on every reconfiguration; timers from an older generation stop.
    generation: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Membership {
    view: View,
    leader: ProcessId,
}

impl MonitorRuntime {
    /// Creates the monitor for replica `me` of `view`.
    ///
    /// The initial leader is replica 0.
    pub fn new(
        me: ProcessId,
        view: View,
        config: WardenConfig,
        engine: Arc<dyn ConsensusEngine>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        if !view.contains(me) {
            return Err(MonitorError::NotAMember { id: me, view });
        }

        let publisher = Arc::new(Publisher::new(engine));
        let graph = Arc::new(SuspicionGraph::new(view, config.graph.clone()));
        let window = config.latency.monitoring_window;

        Ok(Self {
            me,
            sensor: SuspicionSensor::new(me, config.sensor.clone(), clock, Arc::clone(&publisher)),
            aggregator: SuspicionAggregator::new(graph, config.aggregator.clone()),
            latency: LatencyMonitor::new(view),
            propose_latencies: LatencySensor::new(view.n(), window),
            write_latencies: LatencySensor::new(view.n(), window),
            membership: Mutex::new(Membership {
                view,
                leader: ProcessId::new(0),
            }),
            timers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            publisher,
            config,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.me
    }

    pub fn view(&self) -> View {
        lock(&self.membership).view
    }

    pub fn leader(&self) -> ProcessId {
        lock(&self.membership).leader
    }

    pub fn set_leader(&self, leader: ProcessId) {
        lock(&self.membership).leader = leader;
    }

    pub fn graph(&self) -> &SuspicionGraph {
        self.aggregator.graph()
    }

    pub fn aggregator(&self) -> &SuspicionAggregator {
        &self.aggregator
    }

    pub fn latency_monitor(&self) -> &LatencyMonitor {
        &self.latency
    }

    pub fn sensor(&self) -> &SuspicionSensor {
        &self.sensor
    }

    // ========================================================================
    // Ordered delivery
    // ========================================================================

    /// Applies the values ordered in `consensus_id`.
    ///
    /// Must be called once per instance, in commit order.
    pub fn on_ordered_values_delivered(&self, consensus_id: ConsensusId, values: &[OrderedValue]) {
        debug!(replica = %self.me, %consensus_id, count = values.len(), "ordered values delivered");
        for value in values {
            match value.kind {
                MeasurementKind::Latency => {
                    self.latency
                        .notify(value.sender, &value.payload, consensus_id);
                }
                MeasurementKind::Suspicion => {
                    self.notify(value.sender, &value.payload, consensus_id);
                }
            }
        }

        self.aggregator.build_suspicion_graph();
        self.aggregator.decay(consensus_id);
        let retention = i32::try_from(self.config.aggregator.gc_retention).unwrap_or(i32::MAX);
        self.aggregator.garbage_collect(consensus_id - retention);
    }

    /// Handles one ordered suspicion payload from `sender`.
    ///
    /// Stores it and, if it wrongly accuses this replica, publishes a
    /// false-accusation reply.
    pub fn notify(&self, sender: ProcessId, payload: &[u8], consensus_id: ConsensusId) {
        let suspicion = match SuspicionMeasurement::decode(payload, sender) {
            Ok(suspicion) => suspicion,
            Err(e) => {
                METRICS.increment_decode_failures();
                let error = MonitorError::from(e);
                warn!(replica = %self.me, %sender, %consensus_id, %error, "dropping suspicion payload");
                return;
            }
        };

        self.aggregator.on_consensus_delivered(consensus_id, [suspicion]);
        if let Some(reply) = self.sensor.return_suspicion_if_falsely_accused(&suspicion) {
            self.publisher.publish_suspicion(&reply);
        }
    }

    /// Current leader candidates. Identical on every correct replica that
    /// applied the same instances.
    pub fn candidate_set(&self) -> BTreeSet<ProcessId> {
        self.aggregator.graph().candidate_set()
    }

    /// True once enough latency vectors were ordered to predict delays.
    pub fn is_initialized(&self) -> bool {
        self.latency.is_initialized()
    }

    // ========================================================================
    // Local observations
    // ========================================================================

    pub fn check_proposal(
        &self,
        consensus_id: ConsensusId,
        sender: ProcessId,
        sent_timestamp: Nanos,
    ) -> bool {
        self.sensor
            .check_proposal(consensus_id, sender, sent_timestamp)
    }

    pub fn check_vote(
        &self,
        consensus_id: ConsensusId,
        sender: ProcessId,
        phase: ProtocolPhase,
        sent_timestamp: Nanos,
    ) -> bool {
        self.sensor
            .check_vote(consensus_id, sender, phase, sent_timestamp)
    }

    pub fn note_client_request(&self, at: Nanos) {
        self.sensor.note_client_request(at);
    }

    pub fn record_propose_latency(&self, peer: ProcessId, latency: Nanos) {
        self.propose_latencies.record(peer, latency);
    }

    pub fn record_write_latency(&self, peer: ProcessId, latency: Nanos) {
        self.write_latencies.record(peer, latency);
    }

    /// Publishes this replica's latency vectors for ordering.
    pub fn disseminate_latencies(&self) {
        let measurement = LatencyMeasurement::new(
            self.write_latencies.latency_vector(),
            self.propose_latencies.latency_vector(),
        );
        self.publisher.publish_latency(&measurement);
    }

    /// Re-derives the sensor's expectation for `leader` from the ordered
    /// latency matrices. Returns false, leaving the sensor untouched, while
    /// the matrices are not initialized.
    pub fn refresh_expectation(&self, leader: ProcessId) -> bool {
        if !self.latency.is_initialized() {
            debug!(replica = %self.me, "latency matrices not initialized yet");
            return false;
        }
        let model = self.latency.predict_message_delays(leader, self.me);
        self.sensor.set_expectation(model);
        true
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Moves to `view`: stops the timers and resets every component.
    ///
    /// Call [`start`](Self::start) again to resume the periodic tasks.
    pub fn reconfigure(&self, view: View) -> Result<()> {
        if !view.contains(self.me) {
            return Err(MonitorError::NotAMember { id: self.me, view });
        }
        self.stop_timers();

        {
            let mut membership = lock(&self.membership);
            membership.view = view;
            if !view.contains(membership.leader) {
                membership.leader = ProcessId::new(0);
            }
        }
        self.aggregator.reset(view);
        self.latency.set_view(view);
        self.propose_latencies.reset(view.n());
        self.write_latencies.reset(view.n());
        self.sensor.clear();

        info!(replica = %self.me, %view, "monitor reconfigured");
        Ok(())
    }

    /// Spawns the latency dissemination and expectation refresh tasks.
    ///
    /// Must be called from within a Tokio runtime. Calling it while the
    /// tasks already run restarts them.
    pub fn start(self: &Arc<Self>) {
        self.stop_timers();
        let generation = self.generation.load(Ordering::SeqCst);
        let latency = &self.config.latency;

        let dissemination = spawn_periodic(
            Arc::downgrade(self),
            generation,
            latency.sync_delay(),
            latency.sync_period(),
            |runtime| runtime.disseminate_latencies(),
        );
        let refresh = spawn_periodic(
            Arc::downgrade(self),
            generation,
            Duration::ZERO,
            latency.expectation_refresh(),
            |runtime| {
                runtime.refresh_expectation(runtime.leader());
            },
        );

        lock(&self.timers).extend([dissemination, refresh]);
        debug!(replica = %self.me, generation, "monitor timers started");
    }

    /// Cancels the periodic tasks.
    pub fn shutdown(&self) {
        self.stop_timers();
        debug!(replica = %self.me, "monitor shut down");
    }

    /// Number of periodic tasks currently registered.
    pub fn active_timers(&self) -> usize {
        lock(&self.timers)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn stop_timers(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for handle in lock(&self.timers).drain(..) {
            handle.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

impl Drop for MonitorRuntime {
    fn drop(&mut self) {
        self.stop_timers();
    }
}

impl std::fmt::Debug for MonitorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorRuntime")
            .field("me", &self.me)
            .field("membership", &*lock(&self.membership))
            .finish_non_exhaustive()
    }
}

/// Runs `tick` after `delay` and then every `period`, until the runtime is
/// dropped or reconfigured.
fn spawn_periodic(
    runtime: Weak<MonitorRuntime>,
    generation: u64,
    delay: Duration,
    period: Duration,
    tick: impl Fn(&MonitorRuntime) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep(delay).await;
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let Some(strong) = runtime.upgrade() else {
                break;
            };
            if !strong.is_current(generation) {
                break;
            }
            tick(&strong);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::InMemoryOrdering;

    fn runtime(me: u32, ordering: &Arc<InMemoryOrdering>) -> Arc<MonitorRuntime> {
        let view = View::new(4, 1).unwrap();
        Arc::new(
            MonitorRuntime::new(
                ProcessId::new(me),
                view,
                WardenConfig::simulation(),
                ordering.engine_for(ProcessId::new(me)),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap(),
        )
    }

    #[test]
    fn rejects_replica_outside_view() {
        let ordering = InMemoryOrdering::new();
        let result = MonitorRuntime::new(
            ProcessId::new(4),
            View::new(4, 1).unwrap(),
            WardenConfig::default(),
            ordering.engine_for(ProcessId::new(4)),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(MonitorError::NotAMember { .. })));
    }

    #[test]
    fn rejects_invalid_config() {
        let ordering = InMemoryOrdering::new();
        let mut config = WardenConfig::default();
        config.sensor.suspicion_delta = 0.9;
        let result = MonitorRuntime::new(
            ProcessId::new(0),
            View::new(4, 1).unwrap(),
            config,
            ordering.engine_for(ProcessId::new(0)),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(MonitorError::Config(_))));
    }

    #[test]
    fn disseminated_vector_reaches_latency_matrices() {
        let ordering = InMemoryOrdering::new();
        let rt = runtime(2, &ordering);
        rt.record_write_latency(ProcessId::new(0), 7);
        rt.record_propose_latency(ProcessId::new(1), 9);
        rt.disseminate_latencies();

        rt.on_ordered_values_delivered(ConsensusId::new(1), &ordering.take_batch());
        let write = rt.latency_monitor().write_matrix();
        let propose = rt.latency_monitor().propose_matrix();
        assert_eq!(write[2][0], 7);
        assert_eq!(propose[2][1], 9);
        assert!(!rt.is_initialized());
    }

    #[test]
    fn refresh_waits_for_initialization() {
        let ordering = InMemoryOrdering::new();
        let rt = runtime(1, &ordering);
        assert!(!rt.refresh_expectation(ProcessId::new(0)));
        assert!(!rt.sensor().is_armed());
    }

    #[test]
    fn reconfigure_resets_components() {
        let ordering = InMemoryOrdering::new();
        let rt = runtime(1, &ordering);
        rt.graph().add_suspicion(ProcessId::new(0), ProcessId::new(2));
        rt.set_leader(ProcessId::new(3));

        rt.reconfigure(View::new(7, 2).unwrap()).unwrap();
        assert_eq!(rt.graph().edge_count(), 0);
        assert_eq!(rt.graph().vertex_count(), 7);
        assert_eq!(rt.view().n(), 7);
        assert_eq!(rt.leader(), ProcessId::new(3));
        assert!(rt.aggregator().is_empty());

        let shrink = rt.reconfigure(View::new(1, 0).unwrap());
        assert!(matches!(shrink, Err(MonitorError::NotAMember { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_disseminate_until_shutdown() {
        let ordering = InMemoryOrdering::new();
        let rt = runtime(0, &ordering);
        rt.start();
        assert_eq!(rt.active_timers(), 2);

        // sync_delay 0, sync_period 10ms.
        tokio::time::sleep(Duration::from_millis(35)).await;
        let emitted = ordering
            .take_batch()
            .iter()
            .filter(|v| v.kind == MeasurementKind::Latency)
            .count();
        assert!(emitted >= 3, "expected periodic dissemination, got {emitted}");

        rt.shutdown();
        tokio::task::yield_now().await;
        assert_eq!(rt.active_timers(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ordering.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_stops_timers() {
        let ordering = InMemoryOrdering::new();
        let rt = runtime(0, &ordering);
        rt.start();
        rt.reconfigure(View::new(4, 1).unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ordering.pending(), 0);
        assert_eq!(rt.active_timers(), 0);
    }
}
