//! Latency collection and prediction.
//!
//! Each replica keeps a [`LatencySensor`] per message type, periodically
//! publishes the per-peer medians, and every replica stores the ordered
//! vectors as rows of two `n x n` matrices in its [`LatencyMonitor`].
//! Because the rows arrive in total order, every correct replica derives
//! the same [`ExpectationModel`] for the same leader.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};
use warden_types::{ConsensusId, MISSING_VALUE, Nanos, ProcessId, View, is_missing};
use warden_wire::LatencyMeasurement;

use crate::engine::Monitor;
use crate::error::MonitorError;
use crate::instrumentation::METRICS;
use crate::lock;
use crate::sensor::ExpectationModel;

// ============================================================================
// Local sensor
// ============================================================================

/// Sliding window of locally observed latencies towards every peer.
#[derive(Debug)]
pub struct LatencySensor {
    window: usize,
    samples: Mutex<Vec<VecDeque<Nanos>>>,
}

impl LatencySensor {
    pub fn new(n: usize, window: usize) -> Self {
        assert!(window > 0, "latency window must hold at least one sample");
        Self {
            window,
            samples: Mutex::new(vec![VecDeque::new(); n]),
        }
    }

    /// Records one observation towards `peer`. Unknown peers are ignored.
    pub fn record(&self, peer: ProcessId, latency: Nanos) {
        let mut samples = lock(&self.samples);
        let Some(window) = samples.get_mut(peer.as_usize()) else {
            debug!(%peer, "latency sample for unknown peer");
            return;
        };
        if window.len() == self.window {
            window.pop_front();
        }
        window.push_back(latency);
    }

    /// Median latency towards each peer, [`MISSING_VALUE`] where no sample exists.
    pub fn latency_vector(&self) -> Vec<Nanos> {
        lock(&self.samples)
            .iter()
            .map(|window| {
                let mut sorted: Vec<Nanos> = window.iter().copied().collect();
                sorted.sort_unstable();
                sorted.get(sorted.len() / 2).copied().unwrap_or(MISSING_VALUE)
            })
            .collect()
    }

    /// Forgets every sample and resizes for `n` peers.
    pub fn reset(&self, n: usize) {
        *lock(&self.samples) = vec![VecDeque::new(); n];
    }
}

// ============================================================================
// Shared monitor
// ============================================================================

/// Ordered latency vectors of every replica.
#[derive(Debug)]
pub struct LatencyMonitor {
    state: Mutex<LatencyState>,
}

#[derive(Debug)]
struct LatencyState {
    view: View,
    /// `write[i][j]`: latency replica `i` observed for WRITEs towards `j`.
    write: Vec<Vec<Nanos>>,
    /// `propose[i][j]`: latency replica `i` observed for PROPOSEs towards `j`.
    propose: Vec<Vec<Nanos>>,
}

impl LatencyMonitor {
    pub fn new(view: View) -> Self {
        let (write, propose) = empty_matrices(view.n());
        Self {
            state: Mutex::new(LatencyState {
                view,
                write,
                propose,
            }),
        }
    }

    /// Switches to `view`. The matrices are rebuilt on next use.
    pub fn set_view(&self, view: View) {
        lock(&self.state).view = view;
    }

    /// Stores the vectors `sender` published as row `sender`.
    pub fn store(&self, sender: ProcessId, measurement: &LatencyMeasurement) {
        let mut state = lock(&self.state);
        state.ensure_dimensions();
        let n = state.view.n();
        if measurement.n() != n {
            warn!(
                %sender,
                expected = n,
                actual = measurement.n(),
                "dropping latency vector sized for another view"
            );
            return;
        }
        if !state.view.contains(sender) {
            warn!(%sender, "dropping latency vector from outside the view");
            return;
        }
        let row = sender.as_usize();
        state.write[row].copy_from_slice(measurement.write_latencies());
        state.propose[row].copy_from_slice(measurement.propose_latencies());
    }

    /// True once at least `n - f` replicas have reported a real sample.
    pub fn is_initialized(&self) -> bool {
        let mut state = lock(&self.state);
        state.ensure_dimensions();
        let reported = state
            .write
            .iter()
            .zip(&state.propose)
            .filter(|(w, p)| w.iter().chain(p.iter()).any(|&l| !is_missing(l)))
            .count();
        reported >= state.view.quorum()
    }

    pub fn write_matrix(&self) -> Vec<Vec<Nanos>> {
        lock(&self.state).write.clone()
    }

    pub fn propose_matrix(&self) -> Vec<Vec<Nanos>> {
        lock(&self.state).propose.clone()
    }

    /// Predicts the delays replica `me` should observe under `leader`.
    ///
    /// Links are symmetrised with [`sanitize`] first, so a replica cannot
    /// make itself look fast by under-reporting its own latencies.
    ///
    /// - `propose`: `P[leader][me]`
    /// - `write_arrival[j]`: `P[leader][j] + W[j][me]`
    /// - `accept_arrival[j]`: the quorum-th smallest WRITE arrival at `j`,
    ///   plus `W[j][me]`
    /// - `round`: the quorum-th smallest `accept_arrival`
    pub fn predict_message_delays(&self, leader: ProcessId, me: ProcessId) -> ExpectationModel {
        let (write, propose, view) = {
            let mut state = lock(&self.state);
            state.ensure_dimensions();
            (sanitize(&state.write), sanitize(&state.propose), state.view)
        };
        let n = view.n();
        let quorum = view.quorum();
        let (l, m) = (leader.as_usize(), me.as_usize());
        if l >= n || m >= n {
            return missing_model(n);
        }

        let write_arrival: Vec<Nanos> = (0..n).map(|j| link(propose[l][j], write[j][m])).collect();

        let accept_arrival: Vec<Nanos> = (0..n)
            .map(|j| {
                let arrivals_at_j: Vec<Nanos> =
                    (0..n).map(|k| link(propose[l][k], write[k][j])).collect();
                link(kth_smallest(arrivals_at_j, quorum), write[j][m])
            })
            .collect();

        let model = ExpectationModel {
            round: kth_smallest(accept_arrival.clone(), quorum),
            propose: propose[l][m],
            write_arrival,
            accept_arrival,
        };
        debug!(%leader, %me, round = model.round, propose = model.propose, "predicted delays");
        model
    }
}

impl LatencyState {
    fn ensure_dimensions(&mut self) {
        let expected = self.view.n();
        let actual = self.write.len();
        if actual != expected || self.propose.len() != expected {
            METRICS.increment_configuration_resets();
            let error = MonitorError::Configuration { expected, actual };
            warn!(%error, "re-initialising latency matrices");
            (self.write, self.propose) = empty_matrices(expected);
        }
    }
}

impl Monitor for LatencyMonitor {
    fn notify(&self, sender: ProcessId, payload: &[u8], consensus_id: ConsensusId) {
        match LatencyMeasurement::decode(payload) {
            Ok(measurement) => self.store(sender, &measurement),
            Err(e) => {
                METRICS.increment_decode_failures();
                let error = MonitorError::from(e);
                warn!(%sender, %consensus_id, %error, "dropping latency payload");
            }
        }
    }
}

/// Symmetric worst case of a latency matrix: `m*[i][j] = max(m[i][j], m[j][i])`.
pub fn sanitize(matrix: &[Vec<Nanos>]) -> Vec<Vec<Nanos>> {
    let n = matrix.len();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let forward = matrix[i].get(j).copied().unwrap_or(MISSING_VALUE);
                    let backward = matrix[j].get(i).copied().unwrap_or(MISSING_VALUE);
                    forward.max(backward)
                })
                .collect()
        })
        .collect()
}

fn empty_matrices(n: usize) -> (Vec<Vec<Nanos>>, Vec<Vec<Nanos>>) {
    (vec![vec![MISSING_VALUE; n]; n], vec![vec![MISSING_VALUE; n]; n])
}

fn missing_model(n: usize) -> ExpectationModel {
    ExpectationModel {
        round: MISSING_VALUE,
        propose: MISSING_VALUE,
        write_arrival: vec![MISSING_VALUE; n],
        accept_arrival: vec![MISSING_VALUE; n],
    }
}

/// Two consecutive hops. Missing if either hop is.
fn link(first: Nanos, second: Nanos) -> Nanos {
    if is_missing(first) || is_missing(second) {
        MISSING_VALUE
    } else {
        first.saturating_add(second).min(MISSING_VALUE)
    }
}

/// The `k`-th smallest value (1-based), [`MISSING_VALUE`] if there are fewer.
fn kth_smallest(mut values: Vec<Nanos>, k: usize) -> Nanos {
    values.sort_unstable();
    k.checked_sub(1)
        .and_then(|i| values.get(i).copied())
        .unwrap_or(MISSING_VALUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn pid(id: u32) -> ProcessId {
        ProcessId::new(id)
    }

    fn view4() -> View {
        View::new(4, 1).unwrap()
    }

    /// Every link 1ms for writes, 2ms for proposals, 0 on the diagonal.
    fn uniform_monitor() -> LatencyMonitor {
        let monitor = LatencyMonitor::new(view4());
        for i in 0..4 {
            let write = (0..4).map(|j| if i == j { 0 } else { 1_000_000 }).collect();
            let propose = (0..4).map(|j| if i == j { 0 } else { 2_000_000 }).collect();
            monitor.store(pid(i), &LatencyMeasurement::new(write, propose));
        }
        monitor
    }

    #[test]
    fn sensor_reports_median_per_peer() {
        let sensor = LatencySensor::new(3, 5);
        for latency in [5, 1, 9] {
            sensor.record(pid(0), latency);
        }
        sensor.record(pid(2), 4);
        sensor.record(pid(7), 4);
        assert_eq!(sensor.latency_vector(), vec![5, MISSING_VALUE, 4]);
    }

    #[test]
    fn sensor_window_slides() {
        let sensor = LatencySensor::new(1, 3);
        for latency in [100, 100, 100, 1, 1] {
            sensor.record(pid(0), latency);
        }
        assert_eq!(sensor.latency_vector(), vec![1]);
        sensor.reset(2);
        assert_eq!(sensor.latency_vector(), vec![MISSING_VALUE; 2]);
    }

    #[test]
    fn sanitize_takes_symmetric_max() {
        let matrix = vec![vec![0, 5, MISSING_VALUE], vec![3, 0, 2], vec![1, 7, 0]];
        let clean = sanitize(&matrix);
        assert_eq!(clean[0][1], 5);
        assert_eq!(clean[1][0], 5);
        assert_eq!(clean[0][2], MISSING_VALUE);
        assert_eq!(clean[2][0], MISSING_VALUE);
        assert_eq!(clean[1][2], 7);
        for (i, row) in clean.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                assert_eq!(value, clean[j][i]);
            }
        }
    }

    #[test]
    fn initialization_needs_a_quorum_of_rows() {
        let monitor = LatencyMonitor::new(view4());
        assert!(!monitor.is_initialized());
        for i in 0..3 {
            assert!(!monitor.is_initialized());
            monitor.store(pid(i), &LatencyMeasurement::write_only(vec![1, 1, 1, 1]));
        }
        assert!(monitor.is_initialized());
    }

    #[test]
    fn missing_only_rows_do_not_count() {
        let monitor = LatencyMonitor::new(view4());
        for i in 0..4 {
            monitor.store(pid(i), &LatencyMeasurement::write_only(vec![MISSING_VALUE; 4]));
        }
        assert!(!monitor.is_initialized());
    }

    #[test]
    fn wrong_sized_vector_is_dropped() {
        let monitor = LatencyMonitor::new(view4());
        monitor.store(pid(0), &LatencyMeasurement::write_only(vec![1, 1, 1]));
        assert_eq!(monitor.write_matrix(), vec![vec![MISSING_VALUE; 4]; 4]);
    }

    #[test]
    fn notify_decodes_and_drops_garbage() {
        let monitor = LatencyMonitor::new(view4());
        let m = LatencyMeasurement::new(vec![0, 1, 2, 3], vec![4, 5, 6, 7]);
        monitor.notify(pid(2), &m.encode(), ConsensusId::new(1));
        monitor.notify(pid(3), &[0xff], ConsensusId::new(1));
        assert_eq!(monitor.write_matrix()[2], vec![0, 1, 2, 3]);
        assert_eq!(monitor.propose_matrix()[2], vec![4, 5, 6, 7]);
        assert_eq!(monitor.write_matrix()[3], vec![MISSING_VALUE; 4]);
    }

    #[test]
    fn view_change_reinitialises_matrices() {
        let monitor = uniform_monitor();
        monitor.set_view(View::new(7, 2).unwrap());
        assert!(!monitor.is_initialized());
        assert_eq!(monitor.write_matrix(), vec![vec![MISSING_VALUE; 7]; 7]);
    }

    #[test]
    fn prediction_on_uniform_links() {
        let monitor = uniform_monitor();
        let model = monitor.predict_message_delays(pid(0), pid(1));

        assert_eq!(model.propose, 2_000_000);
        // Leader's own WRITE: P[0][0] + W[0][1] = 0 + 1ms.
        assert_eq!(model.write_arrival[0], 1_000_000);
        // Own WRITE: P[0][1] + W[1][1] = 2ms + 0.
        assert_eq!(model.write_arrival[1], 2_000_000);
        assert_eq!(model.write_arrival[2], 3_000_000);

        // WRITE arrivals at replica 2: [1ms, 3ms, 2ms, 3ms]; 3rd smallest = 3ms.
        assert_eq!(model.accept_arrival[2], 4_000_000);
        // At replica 1 (me): [1ms, 2ms, 3ms, 3ms] -> 3ms, plus W[1][1] = 0.
        assert_eq!(model.accept_arrival[1], 3_000_000);
        assert_eq!(model.round, 4_000_000);
    }

    #[test]
    fn prediction_without_data_is_missing() {
        let monitor = LatencyMonitor::new(view4());
        let model = monitor.predict_message_delays(pid(0), pid(1));
        assert_eq!(model.propose, MISSING_VALUE);
        assert!(model.write_arrival.iter().all(|&l| l == MISSING_VALUE));
        assert_eq!(model.round, MISSING_VALUE);
    }

    #[test]
    fn prediction_for_unknown_replica_is_missing() {
        let monitor = uniform_monitor();
        assert_eq!(
            monitor.predict_message_delays(pid(9), pid(1)).propose,
            MISSING_VALUE
        );
    }

    #[test_case(1, 2, 3; "plain sum")]
    #[test_case(MISSING_VALUE, 2, MISSING_VALUE; "missing first hop")]
    #[test_case(2, MISSING_VALUE, MISSING_VALUE; "missing second hop")]
    #[test_case(MISSING_VALUE - 1, MISSING_VALUE - 1, MISSING_VALUE; "saturates at sentinel")]
    fn two_hop_links(first: Nanos, second: Nanos, expected: Nanos) {
        assert_eq!(link(first, second), expected);
    }

    #[test]
    fn kth_smallest_bounds() {
        assert_eq!(kth_smallest(vec![5, 1, 3], 2), 3);
        assert_eq!(kth_smallest(vec![5, 1, 3], 4), MISSING_VALUE);
        assert_eq!(kth_smallest(vec![5, 1, 3], 0), MISSING_VALUE);
    }
}
