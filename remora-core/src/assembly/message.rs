//! Receiver-side message reassembly with erasure recovery.
//!
//! One entry per in-flight tracking id collects data and parity
//! shards. A message completes once `data + parity ≥ K`; missing data
//! shards are then recovered through the parity code and the payloads
//! concatenated in chunk order, trimmed to the tail length carried in
//! the last shard's size prefix.
//!
//! Completing an entry while a *newer* tracking id is still in flight
//! means the stream has already moved on: the whole table is flushed
//! so the receive stream only ever advances.

use std::collections::BTreeMap;

use crate::chunk::{CHUNK_PAYLOAD_SIZE, Chunk, ChunkPayload, DataPayload};
use crate::erasure;
use crate::error::TransportError;
use crate::metrics::ConnectionMetrics;

/// In-flight message entries kept before the oldest is evicted.
pub const MESSAGE_TABLE_CAPACITY: usize = 512;

// ── MessageEntry ─────────────────────────────────────────────────

/// Reassembly state for one message.
#[derive(Debug, Default)]
struct MessageEntry {
    /// Data shard slots; allocated by the first data chunk, which
    /// fixes K.
    data: Vec<Option<Vec<u8>>>,
    /// Parity shard slots; allocated by the first parity chunk,
    /// which fixes M.
    ecc: Vec<Option<Vec<u8>>>,
    received_data: usize,
    received_ecc: usize,
}

impl MessageEntry {
    fn missing_slots(&self) -> usize {
        self.data.len() - self.received_data + self.ecc.len() - self.received_ecc
    }

    fn is_complete(&self) -> bool {
        !self.data.is_empty() && self.received_data + self.received_ecc >= self.data.len()
    }

    /// Recover missing data shards and emit the message bytes.
    fn reconstruct(self) -> Result<Vec<u8>, TransportError> {
        let k = self.data.len();
        let m = self.ecc.len();

        let mut shards = self.data;
        if self.received_data < k {
            if m == 0 {
                return Err(TransportError::Erasure(
                    "missing data shards and no parity received".into(),
                ));
            }
            shards.extend(self.ecc);
            erasure::reconstruct(&mut shards, k, m)?;
            shards.truncate(k);
        }

        let last = shards[k - 1]
            .as_deref()
            .ok_or_else(|| TransportError::Erasure("last data shard unrecovered".into()))?;
        let tail = (DataPayload::from_shard(last)?.size as usize).min(CHUNK_PAYLOAD_SIZE);

        let mut message = Vec::with_capacity((k - 1) * CHUNK_PAYLOAD_SIZE + tail);
        for (i, shard) in shards.iter().enumerate() {
            let shard = shard
                .as_deref()
                .ok_or_else(|| TransportError::Erasure("data shard unrecovered".into()))?;
            // skip the 2-byte size prefix
            let payload = &shard[2..];
            if i + 1 == k {
                message.extend_from_slice(&payload[..tail]);
            } else {
                message.extend_from_slice(payload);
            }
        }

        Ok(message)
    }
}

// ── MessageAssembler ─────────────────────────────────────────────

/// Reassembles messages from an unordered, lossy, duplicated stream
/// of data and parity chunks.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    reassembly: BTreeMap<u64, MessageEntry>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight entries (for diagnostics).
    pub fn in_flight(&self) -> usize {
        self.reassembly.len()
    }

    /// Feed one chunk; returns the completed message bytes at most
    /// once per call.
    pub fn process(&mut self, chunk: &Chunk, metrics: &mut ConnectionMetrics) -> Option<Vec<u8>> {
        let (shard, is_ecc) = match &chunk.payload {
            ChunkPayload::Data(data) => (data.shard(), false),
            ChunkPayload::Ecc(ecc) => (ecc.bytes.to_vec(), true),
            ChunkPayload::Control(_) => {
                metrics.invalid_packets += 1;
                return None;
            }
        };

        let tracking_id = chunk.header.tracking_id;
        self.get_entry(tracking_id, metrics);
        // Gone again only if the insert itself was evicted.
        let entry = self.reassembly.get_mut(&tracking_id)?;

        let (slots, received) = if is_ecc {
            (&mut entry.ecc, &mut entry.received_ecc)
        } else {
            (&mut entry.data, &mut entry.received_data)
        };

        // The first chunk of a kind fixes the slot count.
        if slots.is_empty() {
            slots.resize(chunk.header.chunk_count as usize, None);
        }

        let index = chunk.header.chunk_index as usize;
        if index >= slots.len() {
            metrics.invalid_packets += 1;
            return None;
        }
        if slots[index].is_some() {
            metrics.duplicate_packets += 1;
            return None;
        }

        slots[index] = Some(shard);
        *received += 1;

        self.try_complete(tracking_id, metrics)
    }

    /// Create the entry on first sight, evicting the oldest entries
    /// past capacity.
    fn get_entry(&mut self, tracking_id: u64, metrics: &mut ConnectionMetrics) {
        if self.reassembly.contains_key(&tracking_id) {
            return;
        }
        self.reassembly.insert(tracking_id, MessageEntry::default());

        while self.reassembly.len() > MESSAGE_TABLE_CAPACITY {
            if let Some((_, evicted)) = self.reassembly.pop_first() {
                metrics.lost_packets += evicted.missing_slots() as i64;
            }
        }
    }

    fn try_complete(
        &mut self,
        tracking_id: u64,
        metrics: &mut ConnectionMetrics,
    ) -> Option<Vec<u8>> {
        let complete = self
            .reassembly
            .get(&tracking_id)
            .is_some_and(MessageEntry::is_complete);
        if !complete {
            metrics.valid_packets += 1;
            return None;
        }

        let entry = self.reassembly.remove(&tracking_id)?;

        // An older completion with newer work in flight is stale:
        // flush everything so tracking ids only advance.
        if let Some((&max_remaining, _)) = self.reassembly.last_key_value() {
            if max_remaining > tracking_id {
                metrics.out_of_order_frames += 1;
                self.reassembly.clear();
            }
        }

        match entry.reconstruct() {
            Ok(message) => {
                metrics.valid_packets += 1;
                Some(message)
            }
            Err(_) => {
                metrics.invalid_frames += 1;
                None
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::packet::assemble_frame;

    fn chunks_for(message: &[u8], ratio: f32) -> (Vec<Chunk>, Vec<Chunk>) {
        let frame = assemble_frame(message, ratio).unwrap();
        (frame.data, frame.ecc)
    }

    fn stamp(mut chunk: Chunk, tracking_id: u64) -> Chunk {
        chunk.header.tracking_id = tracking_id;
        chunk
    }

    #[test]
    fn all_data_chunks_reassemble() {
        let message = vec![0x41u8; 500];
        let (data, _) = chunks_for(&message, 0.1);

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();

        assert!(asm.process(&data[0], &mut metrics).is_none());
        let out = asm.process(&data[1], &mut metrics).unwrap();
        assert_eq!(out, message);
        assert_eq!(metrics.invalid_packets, 0);
    }

    #[test]
    fn parity_replaces_lost_data() {
        let message = vec![0x41u8; 500];
        let (data, ecc) = chunks_for(&message, 0.1);
        assert_eq!(ecc.len(), 1);

        // data[0] lost; data[1] + ecc[0] still recover the message.
        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();
        assert!(asm.process(&ecc[0], &mut metrics).is_none());
        let out = asm.process(&data[1], &mut metrics).unwrap();
        assert_eq!(out, message);
    }

    #[test]
    fn recovered_last_chunk_keeps_tail_length() {
        let message = vec![0x41u8; 500];
        let (data, ecc) = chunks_for(&message, 0.1);

        // The *last* chunk (which carries the tail size) is lost.
        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();
        assert!(asm.process(&data[0], &mut metrics).is_none());
        let out = asm.process(&ecc[0], &mut metrics).unwrap();
        assert_eq!(out, message);
    }

    #[test]
    fn any_order_reassembles() {
        let message: Vec<u8> = (0..4000u32).map(|v| v as u8).collect();
        let (data, _) = chunks_for(&message, 0.1);
        assert!(data.len() > 2);

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();

        let mut out = None;
        for chunk in data.iter().rev() {
            out = asm.process(chunk, &mut metrics);
        }
        assert_eq!(out.unwrap(), message);
    }

    #[test]
    fn duplicates_counted_not_overwritten() {
        let message = vec![9u8; 1000];
        let (data, _) = chunks_for(&message, 0.1);

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();

        asm.process(&data[0], &mut metrics);
        asm.process(&data[0], &mut metrics);
        asm.process(&data[0], &mut metrics);
        assert_eq!(metrics.duplicate_packets, 2);

        let mut out = None;
        for chunk in &data[1..] {
            out = asm.process(chunk, &mut metrics);
        }
        assert_eq!(out.unwrap(), message);
    }

    #[test]
    fn out_of_range_index_is_invalid() {
        let message = vec![9u8; 1000];
        let (data, _) = chunks_for(&message, 0.1);

        let mut bad = data[0].clone();
        bad.header.chunk_index = bad.header.chunk_count + 1;

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();
        asm.process(&data[0], &mut metrics);
        assert!(asm.process(&bad, &mut metrics).is_none());
        assert_eq!(metrics.invalid_packets, 1);
    }

    #[test]
    fn chunk_count_fixed_by_first_chunk() {
        let message = vec![1u8; 1000];
        let (data, ecc) = chunks_for(&message, 0.1);
        assert_eq!(data.len(), 3);

        // A later chunk disagreeing on chunk_count lands out of the
        // slot range fixed by the first chunk and is dropped.
        let mut liar = data[2].clone();
        liar.header.chunk_count = 90;
        liar.header.chunk_index = 89;

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();
        assert!(asm.process(&data[0], &mut metrics).is_none());
        assert!(asm.process(&liar, &mut metrics).is_none());
        assert_eq!(metrics.invalid_packets, 1);

        // The honest remainder still completes.
        assert!(asm.process(&data[2], &mut metrics).is_none());
        let out = asm.process(&ecc[0], &mut metrics).unwrap();
        assert_eq!(out, message);
    }

    #[test]
    fn out_of_order_completion_flushes_table() {
        let message = vec![7u8; 100];
        let (data, _) = chunks_for(&message, 0.1);
        assert_eq!(data.len(), 1);

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();

        // Newer id 11 starts (incomplete would need >1 chunk) — use a
        // two-chunk message for the newer entry.
        let big = vec![8u8; 1000];
        let (big_data, _) = chunks_for(&big, 0.1);
        assert!(big_data.len() > 1);

        assert!(asm
            .process(&stamp(big_data[0].clone(), 11), &mut metrics)
            .is_none());

        // Older id 9 completes while 11 is still in flight.
        let out = asm.process(&stamp(data[0].clone(), 9), &mut metrics);
        assert!(out.is_some());
        assert_eq!(metrics.out_of_order_frames, 1);
        assert_eq!(asm.in_flight(), 0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let message = vec![1u8; 1000];
        let (data, _) = chunks_for(&message, 0.1);
        let chunks_missing = data.len() - 1; // parity slots unallocated

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();

        for id in 0..=MESSAGE_TABLE_CAPACITY as u64 {
            asm.process(&stamp(data[0].clone(), id), &mut metrics);
        }

        assert_eq!(asm.in_flight(), MESSAGE_TABLE_CAPACITY);
        assert_eq!(metrics.lost_packets, chunks_missing as i64);
    }

    #[test]
    fn empty_message_reassembles() {
        let (data, _) = chunks_for(&[], 0.1);
        assert_eq!(data.len(), 1);

        let mut asm = MessageAssembler::new();
        let mut metrics = ConnectionMetrics::default();
        let out = asm.process(&data[0], &mut metrics).unwrap();
        assert!(out.is_empty());
    }
}
