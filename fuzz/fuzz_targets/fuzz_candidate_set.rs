#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use warden_monitor::{CandidateStrategy, ProcessId, SuspicionGraph, View};
use warden_monitor::WardenConfig;

#[derive(Debug, Arbitrary)]
struct Input {
    faults: u8,
    exhaustive: bool,
    edges: Vec<(u8, u8)>,
}

fuzz_target!(|input: Input| {
    let f = usize::from(input.faults % 8);
    let view = View::new(3 * f + 1, f).expect("3f + 1 is a valid view");
    let n = view.n() as u8;

    let mut graph_config = WardenConfig::default().graph;
    if input.exhaustive {
        graph_config.strategy = CandidateStrategy::Exhaustive;
    }
    let graph = SuspicionGraph::new(view, graph_config);
    for (reporter, suspect) in input.edges {
        graph.add_suspicion(
            ProcessId::new(u32::from(reporter % n)),
            ProcessId::new(u32::from(suspect % n)),
        );
    }

    // Self-suspicions are never recorded.
    for (reporter, suspect, _) in graph.edges() {
        assert_ne!(reporter, suspect);
    }

    let candidates = graph.candidate_set();
    assert!(candidates.len() >= view.candidate_floor());
    assert!(candidates.iter().all(|id| view.contains(*id)));
});
