//! Receiver-side frame reassembly: completed messages → frame bytes.
//!
//! The same machine as message reassembly one level up. An entry per
//! tracking id owns one [`MessageAssembler`] per message index; once
//! every message of the frame is complete the buffers are
//! concatenated in `msg_index` order and emitted.
//!
//! The emitted stream advances monotonically in tracking id: a frame
//! completing below the high-water mark is discarded, and a frame
//! completing while newer partial work is in flight flushes that
//! work — an old frame has no value in a real-time stream once a
//! newer one has begun.

use std::collections::BTreeMap;

use crate::assembly::message::MessageAssembler;
use crate::chunk::Chunk;
use crate::metrics::ConnectionMetrics;

/// In-flight frame entries kept before the oldest is evicted.
pub const FRAME_TABLE_CAPACITY: usize = 5;

// ── FrameEntry ───────────────────────────────────────────────────

/// Reassembly state for one frame.
#[derive(Debug, Default)]
struct FrameEntry {
    /// One message assembler per message index, created lazily; the
    /// first chunk fixes the message count.
    assemblers: Vec<Option<MessageAssembler>>,
    /// Completed message buffers by message index.
    messages: Vec<Option<Vec<u8>>>,
    received: usize,
}

impl FrameEntry {
    fn is_complete(&self) -> bool {
        !self.messages.is_empty() && self.received == self.messages.len()
    }

    fn concatenate(self) -> Vec<u8> {
        let mut frame = Vec::new();
        for message in self.messages.into_iter().flatten() {
            frame.extend_from_slice(&message);
        }
        frame
    }
}

// ── FrameAssembler ───────────────────────────────────────────────

/// Reassembles frames from the chunk stream of a connected endpoint.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    reassembly: BTreeMap<u64, FrameEntry>,
    /// Highest tracking id ever emitted.
    high_water: Option<u64>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight entries (for diagnostics).
    pub fn in_flight(&self) -> usize {
        self.reassembly.len()
    }

    /// Feed one data or parity chunk; returns the completed frame
    /// bytes at most once per call.
    pub fn process(&mut self, chunk: &Chunk, metrics: &mut ConnectionMetrics) -> Option<Vec<u8>> {
        let tracking_id = chunk.header.tracking_id;
        self.get_entry(tracking_id, metrics);
        // Gone again only if the insert itself was evicted.
        let entry = self.reassembly.get_mut(&tracking_id)?;

        if entry.messages.is_empty() {
            let msg_count = chunk.header.msg_count as usize;
            entry.messages.resize(msg_count, None);
            entry.assemblers.resize_with(msg_count, || None);
        }

        let msg_index = chunk.header.msg_index as usize;
        if msg_index >= entry.messages.len() {
            metrics.invalid_packets += 1;
            return None;
        }

        // Chunks for an already-completed message are stale echoes.
        if entry.messages[msg_index].is_none() {
            let assembler = entry.assemblers[msg_index].get_or_insert_with(MessageAssembler::new);
            if let Some(message) = assembler.process(chunk, metrics) {
                entry.messages[msg_index] = Some(message);
                entry.received += 1;
            }
        }

        self.try_complete(tracking_id, metrics)
    }

    fn get_entry(&mut self, tracking_id: u64, metrics: &mut ConnectionMetrics) {
        if self.reassembly.contains_key(&tracking_id) {
            return;
        }
        self.reassembly.insert(tracking_id, FrameEntry::default());

        while self.reassembly.len() > FRAME_TABLE_CAPACITY {
            if self.reassembly.pop_first().is_some() {
                metrics.lost_frames += 1;
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
            .is_some_and(FrameEntry::is_complete);
        if !complete {
            metrics.valid_packets += 1;
            return None;
        }

        let entry = self.reassembly.remove(&tracking_id)?;

        // The stream has already emitted a newer frame: this one is
        // stale and never surfaces.
        if self.high_water.is_some_and(|hw| tracking_id < hw) {
            metrics.out_of_order_frames += 1;
            return None;
        }

        // Newer partial work in flight is abandoned so the table
        // restarts clean.
        if let Some((&max_remaining, _)) = self.reassembly.last_key_value() {
            if max_remaining > tracking_id {
                metrics.out_of_order_frames += 1;
                self.reassembly.clear();
            }
        }

        self.high_water = Some(tracking_id);
        Some(entry.concatenate())
    }
}

// ── Tests ────────────────────────────────────────────────────────
