//! The suspicion graph and candidate-set selection.
//!
//! A directed weighted graph over the replicas of a view. An edge
//! `reporter -> suspect` carries the accumulated, decayed weight of every
//! suspicion `reporter` raised against `suspect`.
//!
//! # Invariants
//!
//! - No self-loops.
//! - Every stored weight is `> 0`; an edge decayed to zero is removed.
//! - The vertex set is always `0..n` of the current view.
//!
//! # Candidate set
//!
//! Only *mutual* suspicion counts towards exclusion. A one-sided accusation
//! is as likely to come from a Byzantine reporter as from a real delay, so
//! on its own it excludes nobody. The heuristic:
//!
//! 1. Build the undirected mutual-suspicion graph.
//! 2. Greedily match its edges in `(min, max)` id order.
//! 3. Enumerate its triangles.
//! 4. A triangle containing a matched edge contributes its unmatched
//!    vertices as additional exclusions.
//! 5. Clamp the exclusion list to `n - f - 1`, releasing the replicas with
//!    the lowest in-degree first (ties by id).
//! 6. Everyone not excluded is a candidate.
//!
//! With `CandidateStrategy::Exhaustive` a maximum independent set of the
//! mutual graph is searched first under a wall-clock budget; if it has at
//! least `f + 1` members it is the answer, otherwise the heuristic is.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Mutex;

use tracing::{debug, info, trace, warn};
use warden_config::{CandidateStrategy, GraphConfig};
use warden_types::{ProcessId, View};
use warden_wire::SuspicionMeasurement;

use crate::error::MonitorError;
use crate::independent_set::{self, Mask};
use crate::instrumentation::METRICS;
use crate::lock;

/// Views larger than this always use the heuristic, whatever the config says.
pub const MAX_EXHAUSTIVE_VERTICES: usize = independent_set::MAX_VERTICES;

/// Weight added by one suspicion.
const SUSPICION_WEIGHT: f64 = 1.0;

type Adjacency = BTreeMap<ProcessId, BTreeSet<ProcessId>>;

/// Thread-safe suspicion graph.
#[derive(Debug)]
pub struct SuspicionGraph {
    config: GraphConfig,
    state: Mutex<GraphState>,
}

#[derive(Debug)]
struct GraphState {
    view: View,
    edges: HashMap<(ProcessId, ProcessId), f64>,
    last_candidates: Option<BTreeSet<ProcessId>>,
}

impl SuspicionGraph {
    pub fn new(view: View, config: GraphConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GraphState {
                view,
                edges: HashMap::new(),
                last_candidates: None,
            }),
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Records one suspicion of `suspect` by `reporter`.
    ///
    /// Self-suspicion and ids outside the view are ignored. Returns true if
    /// an edge was created or strengthened.
    pub fn add_suspicion(&self, reporter: ProcessId, suspect: ProcessId) -> bool {
        let mut state = lock(&self.state);
        let added = state.add(reporter, suspect);
        METRICS.set_edge_count(state.edges.len() as u64);
        added
    }

    /// Adds every measurement as a suspicion. Returns how many were applied.
    pub fn populate(&self, measurements: &[SuspicionMeasurement]) -> usize {
        let mut state = lock(&self.state);
        let applied = measurements
            .iter()
            .filter(|m| state.add(m.reporter, m.suspect))
            .count();
        METRICS.add_suspicions_applied(applied as u64);
        METRICS.set_edge_count(state.edges.len() as u64);
        trace!(graph = %state.render_ascii(), "suspicion graph updated");
        applied
    }

    /// Lowers every edge weight by `strength`, dropping edges that reach zero.
    pub fn remove_suspicions(&self, strength: f64) {
        if !(strength > 0.0) {
            return;
        }
        let mut state = lock(&self.state);
        let before = state.edges.len();
        state.edges.retain(|_, weight| {
            *weight -= strength;
            *weight > 0.0
        });
        debug!(
            strength,
            dropped = before - state.edges.len(),
            remaining = state.edges.len(),
            "decayed suspicion graph"
        );
        METRICS.set_edge_count(state.edges.len() as u64);
    }

    /// Drops every edge, keeping the vertex set.
    pub fn clear_suspicions(&self) {
        let mut state = lock(&self.state);
        state.edges.clear();
        state.last_candidates = None;
        METRICS.set_edge_count(0);
    }

    /// Replaces the vertex set with the replicas of `view`. All edges are dropped.
    pub fn resize(&self, view: View) {
        let mut state = lock(&self.state);
        debug!(from = %state.view, to = %view, "resizing suspicion graph");
        state.view = view;
        state.edges.clear();
        state.last_candidates = None;
        METRICS.set_edge_count(0);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns true if `reporter` suspects `suspect`.
    ///
    /// A replica trivially "suspects" itself: the self query returns true.
    pub fn exists_edge(&self, reporter: ProcessId, suspect: ProcessId) -> bool {
        reporter == suspect || lock(&self.state).edges.contains_key(&(reporter, suspect))
    }

    pub fn edge_weight(&self, reporter: ProcessId, suspect: ProcessId) -> Option<f64> {
        lock(&self.state).edges.get(&(reporter, suspect)).copied()
    }

    pub fn edge_count(&self) -> usize {
        lock(&self.state).edges.len()
    }

    pub fn vertex_count(&self) -> usize {
        lock(&self.state).view.n()
    }

    /// Number of replicas currently suspecting `suspect`.
    pub fn in_degree(&self, suspect: ProcessId) -> usize {
        lock(&self.state).in_degree(suspect)
    }

    pub fn view(&self) -> View {
        lock(&self.state).view
    }

    /// All edges as `(reporter, suspect, weight)`, sorted by endpoints.
    pub fn edges(&self) -> Vec<(ProcessId, ProcessId, f64)> {
        let state = lock(&self.state);
        let mut edges: Vec<_> = state
            .edges
            .iter()
            .map(|(&(reporter, suspect), &weight)| (reporter, suspect, weight))
            .collect();
        edges.sort_by_key(|&(reporter, suspect, _)| (reporter, suspect));
        edges
    }

    /// One `"u --(w)--> v"` line per edge, or `[graph is empty]`.
    pub fn render_ascii(&self) -> String {
        lock(&self.state).render_ascii()
    }

    // ========================================================================
    // Candidate set
    // ========================================================================

    /// Computes the leader candidates. Always returns at least `f + 1` ids.
    pub fn candidate_set(&self) -> BTreeSet<ProcessId> {
        let mut state = lock(&self.state);
        let view = state.view;

        let candidates = match self.config.strategy {
            CandidateStrategy::Exhaustive if view.n() <= self.exhaustive_limit() => {
                let budget = self.config.exhaustive_budget();
                let outcome = state.exhaustive_candidates(budget);
                if outcome.timed_out {
                    METRICS.increment_exhaustive_timeouts();
                    let error = MonitorError::TimeoutExceeded { budget };
                    warn!(%error, best = outcome.members.count_ones(), "using best independent set found");
                }
                let members = state.to_ids(outcome.members);
                if members.len() >= view.candidate_floor() {
                    members
                } else {
                    debug!(
                        found = members.len(),
                        floor = view.candidate_floor(),
                        "independent set below floor, using heuristic"
                    );
                    state.heuristic_candidates()
                }
            }
            _ => state.heuristic_candidates(),
        };

        assert!(
            candidates.len() >= view.candidate_floor(),
            "candidate set of {} below floor {}",
            candidates.len(),
            view.candidate_floor()
        );

        METRICS.increment_candidate_sets_computed();
        if state.last_candidates.as_ref() != Some(&candidates) {
            info!(?candidates, view = %view, "new candidate set");
            state.last_candidates = Some(candidates.clone());
        }
        candidates
    }

    fn exhaustive_limit(&self) -> usize {
        self.config
            .exhaustive_max_vertices
            .min(MAX_EXHAUSTIVE_VERTICES)
    }
}

impl GraphState {
    fn add(&mut self, reporter: ProcessId, suspect: ProcessId) -> bool {
        if reporter == suspect || !self.view.contains(reporter) || !self.view.contains(suspect) {
            return false;
        }
        *self.edges.entry((reporter, suspect)).or_insert(0.0) += SUSPICION_WEIGHT;
        true
    }

    fn in_degree(&self, suspect: ProcessId) -> usize {
        self.edges
            .keys()
            .filter(|&&(_, target)| target == suspect)
            .count()
    }

    fn render_ascii(&self) -> String {
        if self.edges.is_empty() {
            return "[graph is empty]".to_string();
        }
        let sorted: BTreeMap<_, _> = self.edges.iter().collect();
        let mut out = String::new();
        for (&(reporter, suspect), weight) in sorted {
            let _ = writeln!(out, "{reporter} --({weight:.2})--> {suspect}");
        }
        out
    }

    /// Undirected graph of pairs that suspect each other. Every vertex of
    /// the view is present, possibly with no neighbours.
    fn mutual_adjacency(&self) -> Adjacency {
        let mut adjacency: Adjacency = self.view.processes().map(|p| (p, BTreeSet::new())).collect();
        for &(u, v) in self.edges.keys() {
            if u < v && self.edges.contains_key(&(v, u)) {
                adjacency.entry(u).or_default().insert(v);
                adjacency.entry(v).or_default().insert(u);
            }
        }
        adjacency
    }

    fn heuristic_candidates(&self) -> BTreeSet<ProcessId> {
        let adjacency = self.mutual_adjacency();

        // Edges in (min, max) order, each listed once.
        let edges = adjacency.iter().flat_map(|(&u, neighbours)| {
            neighbours
                .range((Excluded(u), Unbounded))
                .map(move |&v| (u, v))
        });

        let mut matched = BTreeSet::new();
        let mut matching = BTreeSet::new();
        for (u, v) in edges {
            if !matched.contains(&u) && !matched.contains(&v) {
                matched.insert(u);
                matched.insert(v);
                matching.insert((u, v));
            }
        }

        let mut exclusions = matched.clone();
        for (u, v, w) in triangles(&adjacency) {
            let touches_matching = matching.contains(&(u, v))
                || matching.contains(&(u, w))
                || matching.contains(&(v, w));
            if touches_matching {
                exclusions.extend([u, v, w].into_iter().filter(|x| !matched.contains(x)));
            }
        }

        self.clamp_exclusions(&mut exclusions);

        trace!(?matching, ?exclusions, "heuristic exclusions");
        self.view
            .processes()
            .filter(|p| !exclusions.contains(p))
            .collect()
    }

    /// Shrinks `exclusions` to at most `n - f - 1` members, releasing the
    /// least-suspected replicas first.
    fn clamp_exclusions(&self, exclusions: &mut BTreeSet<ProcessId>) {
        let max = self.view.max_exclusions();
        if exclusions.len() <= max {
            return;
        }
        let mut ranked: Vec<(usize, ProcessId)> = exclusions
            .iter()
            .map(|&p| (self.in_degree(p), p))
            .collect();
        ranked.sort_unstable();

        let excess = exclusions.len() - max;
        for &(in_degree, p) in ranked.iter().take(excess) {
            debug!(process = %p, in_degree, "released from exclusion list");
            exclusions.remove(&p);
        }
    }

    fn exhaustive_candidates(&self, budget: std::time::Duration) -> independent_set::SearchOutcome {
        let adjacency = self.mutual_adjacency();
        let masks: Vec<Mask> = adjacency
            .values()
            .map(|neighbours| {
                neighbours
                    .iter()
                    .fold(0, |mask, p| mask | independent_set::bit(p.as_usize()))
            })
            .collect();
        independent_set::maximum_independent_set(&masks, budget)
    }

    fn to_ids(&self, mask: Mask) -> BTreeSet<ProcessId> {
        independent_set::members(mask)
            .map(|v| ProcessId::new(v as u32))
            .filter(|&p| self.view.contains(p))
            .collect()
    }
}

/// Triangles `(u, v, w)` with `u < v < w`.
fn triangles(adjacency: &Adjacency) -> Vec<(ProcessId, ProcessId, ProcessId)> {
    let mut found = Vec::new();
    for (&u, u_neighbours) in adjacency {
        for &v in u_neighbours.range((Excluded(u), Unbounded)) {
            let Some(v_neighbours) = adjacency.get(&v) else {
                continue;
            };
            for &w in u_neighbours.range((Excluded(v), Unbounded)) {
                if v_neighbours.contains(&w) {
                    found.push((u, v, w));
                }
            }
        }
    }
    found
}
