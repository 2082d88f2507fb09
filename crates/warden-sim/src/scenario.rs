//! Full replica set over an in-memory total order.
//!
//! Liars publish SLOW suspicions against honest replicas. The accused
//! replica answers with a false-accusation suspicion, the pair becomes
//! mutually suspicious and every replica should exclude it from the same
//! candidate set.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, ensure};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};
use warden_monitor::{
    ConsensusId, InMemoryOrdering, ManualClock, MonitorRuntime, Nanos, ProcessId, ProtocolPhase,
    Publisher, SuspicionMeasurement, View, WardenConfig,
};

const MS: Nanos = 1_000_000;

/// Instance at which the liars claim to have seen a slow write.
const ACCUSED_INSTANCE: i32 = 5;

/// Upper bound on settle rounds; replies never chain further than this.
const MAX_SETTLE_ROUNDS: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub n: usize,
    pub f: usize,
    pub seed: u64,
    pub liars: Vec<u32>,
    pub accusations: Vec<(u32, u32)>,
    pub instances: i32,
    pub edges: Vec<(u32, u32)>,
    pub candidates: Vec<u32>,
    /// True when every replica computed the same candidate set.
    pub agreed: bool,
}

pub struct Scenario {
    view: View,
    ordering: Arc<InMemoryOrdering>,
    replicas: Vec<Arc<MonitorRuntime>>,
    next_consensus: i32,
}

impl Scenario {
    pub fn new(n: usize, f: usize, config: &WardenConfig) -> Result<Self> {
        let view = View::new(n, f)?;
        let clock = Arc::new(ManualClock::new(0));
        let ordering = InMemoryOrdering::new();
        let replicas = view
            .processes()
            .map(|id| {
                MonitorRuntime::new(
                    id,
                    view,
                    config.clone(),
                    ordering.engine_for(id),
                    clock.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            view,
            ordering,
            replicas,
            next_consensus: 1,
        })
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn replica(&self, id: ProcessId) -> &MonitorRuntime {
        &self.replicas[id.as_usize()]
    }

    /// Orders everything pending as the next instance on every replica.
    pub fn deliver(&mut self) -> usize {
        let consensus_id = ConsensusId::new(self.next_consensus);
        self.next_consensus += 1;
        let batch = self.ordering.take_batch();
        for replica in &self.replicas {
            replica.on_ordered_values_delivered(consensus_id, &batch);
        }
        batch.len()
    }

    /// Delivers until nothing is pending.
    pub fn settle(&mut self) -> Result<()> {
        for _ in 0..MAX_SETTLE_ROUNDS {
            if self.ordering.pending() == 0 {
                return Ok(());
            }
            self.deliver();
        }
        ensure!(
            self.ordering.pending() == 0,
            "ordering did not settle after {MAX_SETTLE_ROUNDS} instances"
        );
        Ok(())
    }

    /// Uniform links (write 1ms, propose 2ms), disseminated and ordered,
    /// then every sensor armed for leader 0.
    pub fn arm(&mut self) -> Result<()> {
        for replica in &self.replicas {
            let me = replica.id();
            for peer in self.view.processes() {
                let (write, propose) = if peer == me { (0, 0) } else { (MS, 2 * MS) };
                replica.record_write_latency(peer, write);
                replica.record_propose_latency(peer, propose);
            }
            replica.disseminate_latencies();
        }
        self.deliver();

        let leader = ProcessId::new(0);
        for replica in &self.replicas {
            ensure!(
                replica.refresh_expectation(leader),
                "replica {} has no latency matrices",
                replica.id()
            );
        }
        Ok(())
    }

    /// Picks `liars` replicas with `rng`; each accuses one random honest
    /// replica of a slow write.
    pub fn accuse(&self, liars: usize, rng: &mut impl Rng) -> Vec<(ProcessId, ProcessId)> {
        let n = self.view.n();
        let chosen: BTreeSet<usize> = index::sample(rng, n, liars.min(n)).into_iter().collect();
        let honest: Vec<usize> = (0..n).filter(|i| !chosen.contains(i)).collect();

        let mut accusations = Vec::with_capacity(chosen.len());
        for &liar in &chosen {
            if honest.is_empty() {
                break;
            }
            let victim = honest[rng.gen_range(0..honest.len())];
            let (liar, victim) = (self.id(liar), self.id(victim));
            Publisher::new(self.ordering.engine_for(liar)).publish_suspicion(
                &SuspicionMeasurement::slow(
                    victim,
                    liar,
                    ProtocolPhase::Write,
                    ConsensusId::new(ACCUSED_INSTANCE),
                ),
            );
            debug!(%liar, %victim, "accusation published");
            accusations.push((liar, victim));
        }
        accusations
    }

    pub fn candidate_sets(&self) -> Vec<BTreeSet<ProcessId>> {
        self.replicas.iter().map(|r| r.candidate_set()).collect()
    }

    /// Arms the replicas, lets `liars` of them lie and settles the order.
    pub fn run(
        n: usize,
        f: usize,
        liars: usize,
        seed: u64,
        config: &WardenConfig,
    ) -> Result<ScenarioReport> {
        ensure!(liars <= f, "{liars} liars exceed the fault bound f = {f}");

        let mut scenario = Self::new(n, f, config)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        scenario.arm()?;
        let accusations = scenario.accuse(liars, &mut rng);
        scenario.settle()?;

        let sets = scenario.candidate_sets();
        let agreed = sets.windows(2).all(|pair| pair[0] == pair[1]);
        let candidates = sets.first().cloned().unwrap_or_default();
        let edges = scenario
            .replica(ProcessId::new(0))
            .graph()
            .edges()
            .into_iter()
            .map(|(reporter, suspect, _)| (reporter.as_u32(), suspect.as_u32()))
            .collect();

        let report = ScenarioReport {
            n,
            f,
            seed,
            liars: accusations.iter().map(|(liar, _)| liar.as_u32()).collect(),
            accusations: accusations
                .iter()
                .map(|(liar, victim)| (liar.as_u32(), victim.as_u32()))
                .collect(),
            instances: scenario.next_consensus - 1,
            edges,
            candidates: candidates.iter().map(|id| id.as_u32()).collect(),
            agreed,
        };
        info!(candidates = ?report.candidates, agreed, "scenario settled");
        Ok(report)
    }

    fn id(&self, index: usize) -> ProcessId {
        debug_assert!(index < self.view.n());
        ProcessId::new(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config() -> WardenConfig {
        WardenConfig::simulation()
    }

    #[test]
    fn single_liar_in_four_is_excluded_with_its_victim() {
        let report = Scenario::run(4, 1, 1, 7, &config()).unwrap();

        assert!(report.agreed);
        assert_eq!(report.accusations.len(), 1);
        let (liar, victim) = report.accusations[0];
        assert_eq!(report.candidates.len(), 2);
        assert!(!report.candidates.contains(&liar));
        assert!(!report.candidates.contains(&victim));
        assert!(report.edges.contains(&(liar, victim)));
        assert!(report.edges.contains(&(victim, liar)));
    }

    #[test]
    fn honest_cluster_offers_everyone() {
        let report = Scenario::run(4, 1, 0, 0, &config()).unwrap();
        assert!(report.agreed);
        assert_eq!(report.candidates, vec![0, 1, 2, 3]);
        assert!(report.edges.is_empty());
    }

    #[test_case(7, 2, 2; "seven replicas two liars")]
    #[test_case(10, 3, 3; "ten replicas three liars")]
    #[test_case(13, 4, 2; "thirteen replicas two liars")]
    fn liars_never_break_the_floor(n: usize, f: usize, liars: usize) {
        for seed in 0..4 {
            let report = Scenario::run(n, f, liars, seed, &config()).unwrap();
            assert!(report.agreed, "seed {seed}");
            assert!(report.candidates.len() > f, "seed {seed}");
            assert_eq!(report.accusations.len(), liars);
            // Each accusation is answered, so every pair ends up mutual.
            for &(liar, victim) in &report.accusations {
                assert!(report.edges.contains(&(victim, liar)), "seed {seed}: {report:?}");
            }
        }
    }

    #[test]
    fn too_many_liars_is_rejected() {
        assert!(Scenario::run(4, 1, 2, 0, &config()).is_err());
    }
}
