//! # warden-monitor: Suspicion monitoring for BFT replicas
//!
//! Each replica runs one [`MonitorRuntime`]. The runtime measures protocol
//! timing locally, submits what it sees to the consensus engine for total
//! order, and folds the ordered stream back into state that is identical on
//! every correct replica:
//!
//! ```text
//!   proposal/vote timing ──► SuspicionSensor ──► Publisher ──► ConsensusEngine
//!                                                                   │
//!                                   on_ordered_values_delivered ◄───┘
//!                                         │                 │
//!                                         ▼                 ▼
//!                               SuspicionAggregator    LatencyMonitor
//!                                         │                 │
//!                                         ▼                 ▼
//!                                  SuspicionGraph     ExpectationModel
//!                                         │
//!                                         ▼
//!                                  candidate_set()
//! ```
//!
//! # Byzantine tolerance
//!
//! Up to `f` replicas may report arbitrary suspicions. A lone accusation only
//! adds a directed edge. The graph excludes replicas that are entangled in a
//! *mutual* suspicion: an honest replica accused by a liar answers with a
//! false-accusation report, the pair becomes mutual, and both leave the
//! candidate set. Every liar can burn at most one honest replica this way,
//! and the exclusion list is clamped so that at least `f + 1` candidates
//! always remain.
//!
//! # Concurrency
//!
//! Each component owns exactly one [`std::sync::Mutex`]. No operation holds
//! two component locks at once: the aggregator releases its store before it
//! touches the graph, and the sensor never touches the graph.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod aggregator;
mod clock;
mod engine;
mod error;
mod graph;
mod independent_set;
pub mod instrumentation;
mod latency;
mod runtime;
mod sensor;


pub use aggregator::SuspicionAggregator;
pub use clock::{ManualClock, SystemClock, TimeSource};
pub use engine::{ConsensusEngine, InMemoryOrdering, Monitor, OrderedValue, Publisher};
pub use error::{MonitorError, Result};
pub use graph::{MAX_EXHAUSTIVE_VERTICES, SuspicionGraph};
pub use latency::{LatencyMonitor, LatencySensor, sanitize};
pub use runtime::MonitorRuntime;
pub use sensor::{ExpectationModel, SuspicionSensor};

// Re-export the vocabulary so embedders need only this crate.
pub use warden_config::{CandidateStrategy, WardenConfig};
pub use warden_types::{
    ConsensusId, MISSING_VALUE, MeasurementKind, Nanos, ProcessId, ProtocolPhase, SuspicionKind,
    View,
};
pub use warden_wire::{DecodeError, LatencyMeasurement, SuspicionMeasurement};

/// Locks a component mutex, recovering the guard if a previous holder
/// panicked. Component state is valid between any two statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
