//! Connection quality counters shared between the reassembly pipeline
//! and the back-channel.
//!
//! Every packet-processing step mutates these counters; the viewer
//! samples them into each back-channel packet so the host can observe
//! link quality end to end. Readers of a shared snapshot tolerate
//! stale values.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Loss, validity and ordering counters for one transport endpoint.
///
/// All counters are monotonically increasing from connection start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Chunks charged to capacity evictions (never arrived).
    pub lost_packets: i64,
    /// Frames evicted from the frame table before completion.
    pub lost_frames: i64,
    /// Messages that completed but could not be reconstructed.
    pub invalid_frames: i64,
    /// Completions that arrived after a newer tracking id had begun.
    pub out_of_order_frames: i64,
    /// Datagrams accepted by the receive loop while connected.
    pub incoming_packets: i64,
    /// Chunks accepted into a reassembly entry.
    pub valid_packets: i64,
    /// Chunks dropped for malformed or out-of-range fields.
    pub invalid_packets: i64,
    /// Chunks that duplicated an already-filled slot.
    pub duplicate_packets: i64,
}

impl ConnectionMetrics {
    /// Encoded size inside the back-channel packet.
    pub const WIRE_SIZE: usize = 64;

    /// Serialize all counters (little-endian).
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(self.lost_packets);
        buf.put_i64_le(self.lost_frames);
        buf.put_i64_le(self.invalid_frames);
        buf.put_i64_le(self.out_of_order_frames);
        buf.put_i64_le(self.incoming_packets);
        buf.put_i64_le(self.valid_packets);
        buf.put_i64_le(self.invalid_packets);
        buf.put_i64_le(self.duplicate_packets);
    }

    /// Deserialize counters from exactly [`Self::WIRE_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(TransportError::InvalidChunkLength {
                expected: Self::WIRE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut buf = bytes;
        Ok(Self {
            lost_packets: buf.get_i64_le(),
            lost_frames: buf.get_i64_le(),
            invalid_frames: buf.get_i64_le(),
            out_of_order_frames: buf.get_i64_le(),
            incoming_packets: buf.get_i64_le(),
            valid_packets: buf.get_i64_le(),
            invalid_packets: buf.get_i64_le(),
            duplicate_packets: buf.get_i64_le(),
        })
    }
}
