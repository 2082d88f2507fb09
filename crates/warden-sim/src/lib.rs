//! Simulation harness for Warden.
//!
//! Two drivers live here, both fully deterministic for a given seed:
//!
//! - [`scale`]: grows the view (`f = 10 * scale`, `n = 3f + 1`), lets `f`
//!   Byzantine replicas entangle themselves in mutual suspicions and times
//!   both candidate strategies on the resulting graph.
//! - [`scenario`]: runs a full replica set over an in-memory total order,
//!   with liars accusing honest replicas and the accused answering.
//!
//! The `warden-sim` binary is a thin CLI over these.

pub mod scale;
pub mod scenario;

pub use scale::{ScaleReport, StrategyRun, entangle, run_scale};
pub use scenario::{Scenario, ScenarioReport};
