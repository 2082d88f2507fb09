//! Latency vectors.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use warden_types::{MISSING_VALUE, Nanos};

use crate::DecodeError;

/// Upper bound on the replica count a latency vector may declare.
///
/// Protects the decoder from allocating for a hostile `n`.
pub const MAX_REPLICAS: usize = 1024;

/// One replica's view of its point-to-point latencies to every replica.
///
/// `write_latencies[j]` and `propose_latencies[j]` are the latencies this
/// replica observed towards replica `j`, or [`MISSING_VALUE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyMeasurement {
    write_latencies: Vec<Nanos>,
    propose_latencies: Vec<Nanos>,
}

impl LatencyMeasurement {
    /// Creates a measurement from both vectors.
    ///
    /// # Panics
    ///
    /// Panics if the vectors differ in length.
    pub fn new(write_latencies: Vec<Nanos>, propose_latencies: Vec<Nanos>) -> Self {
        assert_eq!(
            write_latencies.len(),
            propose_latencies.len(),
            "write and propose vectors must cover the same replicas"
        );
        Self {
            write_latencies,
            propose_latencies,
        }
    }

    /// Creates a measurement whose propose latencies are all missing.
    pub fn write_only(write_latencies: Vec<Nanos>) -> Self {
        let propose_latencies = vec![MISSING_VALUE; write_latencies.len()];
        Self {
            write_latencies,
            propose_latencies,
        }
    }

    /// Number of replicas covered.
    pub fn n(&self) -> usize {
        self.write_latencies.len()
    }

    pub fn write_latencies(&self) -> &[Nanos] {
        &self.write_latencies
    }

    pub fn propose_latencies(&self) -> &[Nanos] {
        &self.propose_latencies
    }

    /// Consumes the measurement, returning `(write, propose)`.
    pub fn into_parts(self) -> (Vec<Nanos>, Vec<Nanos>) {
        (self.write_latencies, self.propose_latencies)
    }

    /// Encoded size for `n` replicas.
    pub fn wire_len(n: usize) -> usize {
        4 + 16 * n
    }

    pub fn encode(&self) -> Bytes {
        let n = self.n();
        let mut buf = BytesMut::with_capacity(Self::wire_len(n));
        buf.put_i32(n as i32);
        for &latency in &self.write_latencies {
            buf.put_i64(latency);
        }
        for &latency in &self.propose_latencies {
            buf.put_i64(latency);
        }
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 4 {
            return Err(DecodeError::Truncated {
                needed: 4,
                available: data.len(),
            });
        }
        let total = data.len();
        let declared = data.get_i32();
        let n = usize::try_from(declared).map_err(|_| DecodeError::NegativeReplicaCount(declared))?;
        if n > MAX_REPLICAS {
            return Err(DecodeError::TooManyReplicas {
                n,
                max: MAX_REPLICAS,
            });
        }

        let needed = Self::wire_len(n);
        if total < needed {
            return Err(DecodeError::Truncated {
                needed,
                available: total,
            });
        }
        if total > needed {
            return Err(DecodeError::TrailingBytes {
                extra: total - needed,
            });
        }

        let write_latencies = (0..n).map(|_| data.get_i64()).collect();
        let propose_latencies = (0..n).map(|_| data.get_i64()).collect();
        Ok(Self {
            write_latencies,
            propose_latencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn write_only_fills_missing_propose() {
        let m = LatencyMeasurement::write_only(vec![10, 20, 30]);
        assert_eq!(m.n(), 3);
        assert_eq!(m.propose_latencies(), &[MISSING_VALUE; 3]);
    }

    #[test]
    fn encoding_layout() {
        let m = LatencyMeasurement::new(vec![1], vec![MISSING_VALUE]);
        let bytes = m.encode();
        assert_eq!(bytes.len(), LatencyMeasurement::wire_len(1));
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..12], &1_i64.to_be_bytes());
        assert_eq!(&bytes[12..20], &MISSING_VALUE.to_be_bytes());
    }

    #[test]
    fn empty_vector_is_valid() {
        let m = LatencyMeasurement::new(Vec::new(), Vec::new());
        assert_eq!(LatencyMeasurement::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn negative_count_rejected() {
        let raw = (-1_i32).to_be_bytes();
        assert_eq!(
            LatencyMeasurement::decode(&raw),
            Err(DecodeError::NegativeReplicaCount(-1))
        );
    }

    #[test]
    fn hostile_count_rejected_without_allocation() {
        let raw = i32::MAX.to_be_bytes();
        assert!(matches!(
            LatencyMeasurement::decode(&raw),
            Err(DecodeError::TooManyReplicas { .. })
        ));
    }

    #[test]
    fn truncated_vector_rejected() {
        let mut raw = LatencyMeasurement::write_only(vec![5, 6]).encode().to_vec();
        raw.pop();
        assert_eq!(
            LatencyMeasurement::decode(&raw),
            Err(DecodeError::Truncated {
                needed: 36,
                available: 35
            })
        );
    }

    #[test]
    #[should_panic(expected = "same replicas")]
    fn mismatched_vectors_panic() {
        let _ = LatencyMeasurement::new(vec![1, 2], vec![1]);
    }

    proptest! {
        /// Property: decode(encode(m)) == m for every valid measurement.
        #[test]
        fn prop_roundtrip(pairs in proptest::collection::vec((any::<i64>(), any::<i64>()), 0..64)) {
            let (write, propose): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
            let m = LatencyMeasurement::new(write, propose);
            prop_assert_eq!(LatencyMeasurement::decode(&m.encode()).unwrap(), m);
        }

        #[test]
        fn prop_decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = LatencyMeasurement::decode(&raw);
        }
    }
}
