//! Decode error types.

/// A measurement payload could not be decoded.
///
/// Callers drop the payload and log; a decode failure never aborts a
/// consensus instance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Payload ended before the record was complete.
    #[error("truncated payload: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Payload continued after the record was complete.
    #[error("{extra} trailing bytes after measurement")]
    TrailingBytes { extra: usize },

    /// Latency vector length was negative.
    #[error("negative replica count {0}")]
    NegativeReplicaCount(i32),

    /// Latency vector length exceeds what any view can hold.
    #[error("replica count {n} exceeds maximum {max}")]
    TooManyReplicas { n: usize, max: usize },

    /// Suspect id was negative.
    #[error("negative suspect id {0}")]
    NegativeSuspect(i32),

    /// Suspicion kind code is not one of the known codes.
    #[error("unknown suspicion kind code {0}")]
    UnknownKind(i32),
}
