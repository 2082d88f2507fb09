//! Error types for the monitor.

use std::time::Duration;

use warden_config::ConfigError;
use warden_types::{ProcessId, View, ViewError};
use warden_wire::DecodeError;

/// Monitor errors.
///
/// None of these abort a consensus instance. Decode failures drop the
/// payload, configuration mismatches re-initialise state and timeouts fall
/// back to the heuristic candidate set.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// A delivered measurement could not be decoded.
    #[error("failed to decode measurement: {0}")]
    Decode(#[from] DecodeError),

    /// Stored latency matrices do not match the current view.
    #[error("latency matrices sized for {actual} replicas, view has {expected}")]
    Configuration { expected: usize, actual: usize },

    /// The exhaustive candidate search ran out of time.
    #[error("exhaustive candidate search exceeded its budget of {budget:?}")]
    TimeoutExceeded { budget: Duration },

    /// The view itself is malformed.
    #[error("invalid view: {0}")]
    InvalidView(#[from] ViewError),

    /// The local replica is not part of the view it was given.
    #[error("replica {id} is not a member of view {view}")]
    NotAMember { id: ProcessId, view: View },

    /// The monitor configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
