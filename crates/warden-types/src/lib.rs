//! # warden-types: Core types for `Warden`
//!
//! This crate contains shared types used across the `Warden` system:
//! - Replica identity ([`ProcessId`]) and view geometry ([`View`])
//! - Consensus instance numbering ([`ConsensusId`])
//! - Protocol vocabulary ([`ProtocolPhase`], [`SuspicionKind`], [`MeasurementKind`])
//! - Durations in nanoseconds ([`Nanos`], [`MISSING_VALUE`])

use std::fmt::{Debug, Display};
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Durations
// ============================================================================

/// A duration or timestamp in nanoseconds.
///
/// Signed because the wire format carries `int64` values and timestamp
/// differences may be negative under clock skew.
pub type Nanos = i64;

/// Sentinel latency meaning "no observation yet".
///
/// Roughly 11.5 days. Large enough that any comparison against a real
/// latency treats the link as unusable, small enough that adding two of
/// them never overflows an `i64`.
pub const MISSING_VALUE: Nanos = 1_000_000_000_000_000;

/// Returns true if the latency is the [`MISSING_VALUE`] sentinel (or worse).
pub fn is_missing(latency: Nanos) -> bool {
    latency >= MISSING_VALUE
}

// ============================================================================
// Entity IDs - All Copy
// ============================================================================

/// Identifier of a replica within the current view, in `[0, n)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ProcessId(u32);

impl ProcessId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the id as a `usize` for indexing per-replica vectors.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProcessId> for u32 {
    fn from(id: ProcessId) -> Self {
        id.0
    }
}

/// Number of a consensus instance.
///
/// Instances are numbered from 0 and committed in ascending order. The wire
/// carries them as `int32`, so the type is signed; non-positive ids are
/// treated as "no predecessor" by the sensor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ConsensusId(i32);

impl ConsensusId {
    pub const ZERO: ConsensusId = ConsensusId(0);

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// The instance immediately before this one.
    pub fn previous(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// Number of instances elapsed since `earlier` (zero if `earlier` is ahead).
    pub fn since(self, earlier: ConsensusId) -> u32 {
        self.0.saturating_sub(earlier.0).max(0) as u32
    }
}

impl Display for ConsensusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ConsensusId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<ConsensusId> for i32 {
    fn from(id: ConsensusId) -> Self {
        id.0
    }
}

impl Add<i32> for ConsensusId {
    type Output = Self;

    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl Sub<i32> for ConsensusId {
    type Output = Self;

    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0.saturating_sub(rhs))
    }
}

// ============================================================================
// Protocol vocabulary
// ============================================================================

/// Phase of a consensus round in which a delay was observed.
///
/// The declaration order is the protocol order and is load-bearing: the
/// derived `Ord` gives `Propose < Write < Accept < Unknown`, which the
/// aggregator uses to keep only the earliest delayed phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolPhase {
    Propose,
    Write,
    Accept,
    Unknown,
}

impl ProtocolPhase {
    /// Wire code of the phase (a UTF-16 code unit).
    pub fn code(self) -> u16 {
        match self {
            Self::Propose => u16::from(b'P'),
            Self::Write => u16::from(b'W'),
            Self::Accept => u16::from(b'A'),
            Self::Unknown => u16::from(b'U'),
        }
    }

    /// Maps a wire code to a phase. Unrecognised codes become `Unknown`.
    pub fn from_code(code: u16) -> Self {
        match u8::try_from(code) {
            Ok(b'P') => Self::Propose,
            Ok(b'W') => Self::Write,
            Ok(b'A') => Self::Accept,
            _ => Self::Unknown,
        }
    }
}

impl Display for ProtocolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Propose => "PROPOSE",
            Self::Write => "WRITE",
            Self::Accept => "ACCEPT",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// What a suspicion report claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SuspicionKind {
    /// The suspect was slower than the latency model allows.
    Slow,
    /// The suspect accused the reporter of being slow, and the reporter disagrees.
    FalseAccusation,
}

impl SuspicionKind {
    pub fn code(self) -> i32 {
        match self {
            Self::Slow => 1,
            Self::FalseAccusation => 2,
        }
    }

    /// Maps a wire code to a kind, `None` for unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Slow),
            2 => Some(Self::FalseAccusation),
            _ => None,
        }
    }
}

impl Display for SuspicionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slow => f.write_str("SLOW"),
            Self::FalseAccusation => f.write_str("FALSE_ACCUSATION"),
        }
    }
}

/// Kind of a monitoring value submitted for total-order agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    Latency,
    Suspicion,
}

// ============================================================================
// View
// ============================================================================

/// Errors constructing a [`View`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    #[error("view must contain at least one replica")]
    Empty,

    #[error("view of {n} replicas cannot tolerate f={f} (requires n >= 3f + 1)")]
    TooManyFaults { n: usize, f: usize },
}

/// The current replica set: `n` replicas, of which up to `f` may be Byzantine.
///
/// Invariant: `n >= 3f + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    n: usize,
    f: usize,
}

impl View {
    /// Creates a view, validating the BFT bound.
    pub fn new(n: usize, f: usize) -> Result<Self, ViewError> {
        if n == 0 {
            return Err(ViewError::Empty);
        }
        if n < 3 * f + 1 {
            return Err(ViewError::TooManyFaults { n, f });
        }
        Ok(Self { n, f })
    }

    /// Creates a view tolerating the largest `f` that `n` allows.
    pub fn with_max_faults(n: usize) -> Result<Self, ViewError> {
        Self::new(n, n.saturating_sub(1) / 3)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn f(&self) -> usize {
        self.f
    }

    /// Quorum size, `n - f`.
    pub fn quorum(&self) -> usize {
        self.n - self.f
    }

    /// Minimum size of any candidate set, `f + 1`.
    pub fn candidate_floor(&self) -> usize {
        self.f + 1
    }

    /// Largest exclusion list that still leaves `f + 1` candidates.
    pub fn max_exclusions(&self) -> usize {
        self.n - self.f - 1
    }

    /// Returns true if `id` names a replica of this view.
    pub fn contains(&self, id: ProcessId) -> bool {
        id.as_usize() < self.n
    }

    /// All process ids of the view in ascending order.
    pub fn processes(&self) -> impl Iterator<Item = ProcessId> + '_ {
        (0..self.n as u32).map(ProcessId::new)
    }
}

impl Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n={} f={}", self.n, self.f)
    }
}
