//! # warden-wire: Measurement wire format
//!
//! Fixed big-endian binary encoding of the two measurement records that
//! replicas submit for total-order agreement:
//!
//! ```text
//! LatencyMeasurement   = i32 n | n x i64 write_latency | n x i64 propose_latency
//! SuspicionMeasurement = i32 suspect | i32 kind_code | u16 phase_code | i32 consensus_id
//! ```
//!
//! The reporter of a suspicion is never on the wire. The transport layer
//! authenticates the sender and the caller hands that id to
//! [`SuspicionMeasurement::decode`].
//!
//! Decoding never panics: every malformed input maps to a [`DecodeError`].

mod error;
mod latency;
mod suspicion;

pub use error::DecodeError;
pub use latency::{LatencyMeasurement, MAX_REPLICAS};
pub use suspicion::{SUSPICION_WIRE_LEN, SuspicionMeasurement};
