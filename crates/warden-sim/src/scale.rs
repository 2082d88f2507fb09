//! Candidate-set computation under adversarial entanglement.

use std::time::{Duration, Instant};

use anyhow::Result;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};
use warden_config::{CandidateStrategy, GraphConfig};
use warden_monitor::instrumentation::METRICS;
use warden_monitor::{MAX_EXHAUSTIVE_VERTICES, ProcessId, SuspicionGraph, View};

/// Faulty replicas per scale step.
pub const FAULTS_PER_SCALE: usize = 10;

/// One strategy's result on the entangled graph.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRun {
    pub strategy: CandidateStrategy,
    pub candidates: usize,
    pub elapsed_micros: u64,
    /// False when the view is too large and the graph used the heuristic.
    pub exhaustive_eligible: bool,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleReport {
    pub scale: u32,
    pub seed: u64,
    pub n: usize,
    pub f: usize,
    pub floor: usize,
    pub edges: usize,
    pub runs: Vec<StrategyRun>,
}

/// Picks `f` liars; each one mutually suspects up to `f` random peers.
///
/// Returns the directed edges. Every pair appears in both directions, the
/// same shape an accusation plus its false-accusation answer leaves behind.
pub fn entangle(view: View, rng: &mut impl Rng) -> Vec<(ProcessId, ProcessId)> {
    let n = view.n();
    let liars = index::sample(rng, n, view.f());
    let mut edges = Vec::new();

    for liar in liars.iter() {
        let victims = rng.gen_range(0..=view.f());
        for peer in index::sample(rng, n, victims.min(n)).iter() {
            if peer == liar {
                continue;
            }
            let (a, b) = (id(liar), id(peer));
            edges.push((a, b));
            edges.push((b, a));
        }
    }
    edges.sort_unstable();
    edges.dedup();
    edges
}

/// Builds the entangled graph for `scale` and runs both strategies on it.
pub fn run_scale(scale: u32, seed: u64, base: &GraphConfig) -> Result<ScaleReport> {
    assert!(scale > 0, "scale starts at 1");

    let f = FAULTS_PER_SCALE * scale as usize;
    let view = View::new(3 * f + 1, f)?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ u64::from(scale));
    let edges = entangle(view, &mut rng);
    debug!(scale, n = view.n(), edges = edges.len(), "graph entangled");

    let runs = [CandidateStrategy::Heuristic, CandidateStrategy::Exhaustive]
        .into_iter()
        .map(|strategy| run_strategy(view, &edges, base, strategy))
        .collect();

    let report = ScaleReport {
        scale,
        seed,
        n: view.n(),
        f,
        floor: view.candidate_floor(),
        edges: edges.len(),
        runs,
    };
    info!(scale, n = report.n, edges = report.edges, "scale step done");
    Ok(report)
}

fn run_strategy(
    view: View,
    edges: &[(ProcessId, ProcessId)],
    base: &GraphConfig,
    strategy: CandidateStrategy,
) -> StrategyRun {
    let config = GraphConfig {
        strategy,
        ..base.clone()
    };
    let exhaustive_eligible = strategy == CandidateStrategy::Exhaustive
        && view.n() <= config.exhaustive_max_vertices.min(MAX_EXHAUSTIVE_VERTICES);

    let graph = SuspicionGraph::new(view, config);
    for &(reporter, suspect) in edges {
        graph.add_suspicion(reporter, suspect);
    }

    let timeouts_before = METRICS.snapshot().exhaustive_timeouts;
    let started = Instant::now();
    let candidates = graph.candidate_set();
    let elapsed = started.elapsed();

    StrategyRun {
        strategy,
        candidates: candidates.len(),
        elapsed_micros: micros(elapsed),
        exhaustive_eligible,
        timeouts: METRICS
            .snapshot()
            .exhaustive_timeouts
            .saturating_sub(timeouts_before),
    }
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

fn id(index: usize) -> ProcessId {
    ProcessId::new(u32::try_from(index).unwrap_or(u32::MAX))
}
