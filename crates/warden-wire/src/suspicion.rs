//! Suspicion reports.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use warden_types::{ConsensusId, ProcessId, ProtocolPhase, SuspicionKind};

use crate::DecodeError;

/// Encoded size of a suspicion: `i32 + i32 + u16 + i32`.
pub const SUSPICION_WIRE_LEN: usize = 4 + 4 + 2 + 4;

/// An accusation by `reporter` that `suspect` misbehaved in `phase` of
/// consensus instance `consensus_id`.
///
/// Field order is load-bearing: the derived `Ord` sorts by consensus id,
/// then phase, then kind, then suspect, then reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SuspicionMeasurement {
    pub consensus_id: ConsensusId,
    pub phase: ProtocolPhase,
    pub kind: SuspicionKind,
    pub suspect: ProcessId,
    /// Attached at receipt from the authenticated sender. Not transmitted.
    pub reporter: ProcessId,
}

impl SuspicionMeasurement {
    pub fn new(
        suspect: ProcessId,
        reporter: ProcessId,
        kind: SuspicionKind,
        phase: ProtocolPhase,
        consensus_id: ConsensusId,
    ) -> Self {
        Self {
            consensus_id,
            phase,
            kind,
            suspect,
            reporter,
        }
    }

    /// A SLOW report.
    pub fn slow(
        suspect: ProcessId,
        reporter: ProcessId,
        phase: ProtocolPhase,
        consensus_id: ConsensusId,
    ) -> Self {
        Self::new(suspect, reporter, SuspicionKind::Slow, phase, consensus_id)
    }

    /// Returns true if the report accuses its own reporter.
    pub fn is_self_suspicion(&self) -> bool {
        self.suspect == self.reporter
    }

    /// Encodes the suspicion. The reporter is omitted.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUSPICION_WIRE_LEN);
        buf.put_i32(self.suspect.as_u32() as i32);
        buf.put_i32(self.kind.code());
        buf.put_u16(self.phase.code());
        buf.put_i32(self.consensus_id.as_i32());
        buf.freeze()
    }

    /// Decodes a suspicion sent by `reporter`.
    pub fn decode(mut data: &[u8], reporter: ProcessId) -> Result<Self, DecodeError> {
        if data.len() < SUSPICION_WIRE_LEN {
            return Err(DecodeError::Truncated {
                needed: SUSPICION_WIRE_LEN,
                available: data.len(),
            });
        }
        if data.len() > SUSPICION_WIRE_LEN {
            return Err(DecodeError::TrailingBytes {
                extra: data.len() - SUSPICION_WIRE_LEN,
            });
        }

        let suspect = data.get_i32();
        let kind_code = data.get_i32();
        let phase_code = data.get_u16();
        let consensus_id = data.get_i32();

        let suspect = u32::try_from(suspect).map_err(|_| DecodeError::NegativeSuspect(suspect))?;
        let kind = SuspicionKind::from_code(kind_code).ok_or(DecodeError::UnknownKind(kind_code))?;

        Ok(Self {
            consensus_id: ConsensusId::new(consensus_id),
            phase: ProtocolPhase::from_code(phase_code),
            kind,
            suspect: ProcessId::new(suspect),
            reporter,
        })
    }
}

impl std::fmt::Display for SuspicionMeasurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} suspects {} of {} in {} of consensus {}",
            self.reporter, self.suspect, self.kind, self.phase, self.consensus_id
        )
    }
}
