//! Sender-side packetization: frame → messages → data + parity chunks.
//!
//! A frame is cut into messages of at most [`MAX_MESSAGE_SIZE`] bytes;
//! each message becomes up to 127 data chunks plus a ratio-derived
//! number of parity chunks. Session and tracking ids are left zero —
//! the endpoint stamps them at send time.

use crate::chunk::{
    CHUNK_PAYLOAD_SIZE, Chunk, ChunkHeader, ChunkPayload, DataPayload, EccPayload,
    MAX_CHUNKS_PER_MESSAGE, MAX_MESSAGE_SIZE,
};
use crate::erasure;
use crate::error::TransportError;

/// Parity chunks per message are capped by the coder's GF(2⁸) bound.
const MAX_ECC_PER_MESSAGE: usize = 128;

// ── FrameChunks ──────────────────────────────────────────────────

/// The packetized form of one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameChunks {
    pub data: Vec<Chunk>,
    pub ecc: Vec<Chunk>,
}

impl FrameChunks {
    /// Transmission order: one parity chunk every
    /// `max(1, data / ecc)` data chunks, remaining parity flushed at
    /// the end. Spreading parity across the window keeps a bursty
    /// loss near the end of a frame recoverable.
    pub fn interleaved(&self) -> Vec<&Chunk> {
        let mut order = Vec::with_capacity(self.data.len() + self.ecc.len());
        let step = (self.data.len() / self.ecc.len().max(1)).max(1);

        let mut j = 0;
        let mut x = 0;
        let mut i = 0usize;
        while x < self.data.len() {
            if i % step == 0 && j < self.ecc.len() {
                order.push(&self.ecc[j]);
                j += 1;
            } else {
                order.push(&self.data[x]);
                x += 1;
            }
            i += 1;
        }

        order.extend(self.ecc[j..].iter());
        order
    }
}

// ── Packetization ────────────────────────────────────────────────

/// Packetize one frame with the given parity ratio.
///
/// A zero-length frame still yields one empty message so the receiver
/// observes the frame boundary.
pub fn assemble_frame(frame: &[u8], ecc_ratio: f32) -> Result<FrameChunks, TransportError> {
    let msg_count = 1 + frame.len().saturating_sub(1) / MAX_MESSAGE_SIZE;
    if msg_count > u8::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            chunks: msg_count,
            max: u8::MAX as usize,
        });
    }

    let mut out = FrameChunks::default();

    for (msg_index, offset) in (0..frame.len().max(1)).step_by(MAX_MESSAGE_SIZE).enumerate() {
        let msg_end = (offset + MAX_MESSAGE_SIZE).min(frame.len());
        let (data, ecc) = assemble_message(&frame[offset..msg_end], ecc_ratio)?;

        for mut chunk in data {
            chunk.header.msg_index = msg_index as u8;
            chunk.header.msg_count = msg_count as u8;
            out.data.push(chunk);
        }
        for mut chunk in ecc {
            chunk.header.msg_index = msg_index as u8;
            chunk.header.msg_count = msg_count as u8;
            out.ecc.push(chunk);
        }
    }

    Ok(out)
}

/// Packetize one message into data chunks plus parity chunks.
fn assemble_message(
    message: &[u8],
    ecc_ratio: f32,
) -> Result<(Vec<Chunk>, Vec<Chunk>), TransportError> {
    let chunk_count = 1 + message.len().max(1).saturating_sub(1) / CHUNK_PAYLOAD_SIZE;
    if chunk_count > MAX_CHUNKS_PER_MESSAGE {
        return Err(TransportError::MessageTooLarge {
            chunks: chunk_count,
            max: MAX_CHUNKS_PER_MESSAGE,
        });
    }

    let mut data = Vec::with_capacity(chunk_count);
    let mut shards = Vec::with_capacity(chunk_count);
    for chunk_index in 0..chunk_count {
        let offset = chunk_index * CHUNK_PAYLOAD_SIZE;
        let take = message.len().saturating_sub(offset).min(CHUNK_PAYLOAD_SIZE);

        let mut payload = DataPayload::empty();
        payload.size = take as u16;
        payload.bytes[..take].copy_from_slice(&message[offset..offset + take]);

        shards.push(payload.shard());
        data.push(Chunk {
            header: ChunkHeader {
                chunk_index: chunk_index as u8,
                chunk_count: chunk_count as u8,
                ..ChunkHeader::default()
            },
            payload: ChunkPayload::Data(payload),
        });
    }

    let parity_count =
        ((chunk_count as f32 * ecc_ratio).ceil() as usize).clamp(1, MAX_ECC_PER_MESSAGE);

    let parity = erasure::encode_parity(&shards, parity_count)?;

    let ecc = parity
        .into_iter()
        .enumerate()
        .map(|(i, shard)| {
            let mut payload = EccPayload::zeroed();
            payload.bytes.copy_from_slice(&shard);
            Chunk {
                header: ChunkHeader {
                    chunk_index: i as u8,
                    chunk_count: parity_count as u8,
                    ..ChunkHeader::default()
                },
                payload: ChunkPayload::Ecc(payload),
            }
        })
        .collect();

    Ok((data, ecc))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frame_two_data_one_ecc() {
        let frame = vec![0x41u8; 500];
        let chunks = assemble_frame(&frame, 0.1).unwrap();

        assert_eq!(chunks.data.len(), 2);
        assert_eq!(chunks.ecc.len(), 1);

        for chunk in &chunks.data {
            assert_eq!(chunk.header.msg_index, 0);
            assert_eq!(chunk.header.msg_count, 1);
            assert_eq!(chunk.header.chunk_count, 2);
        }

        let ChunkPayload::Data(last) = &chunks.data[1].payload else {
            panic!("expected data payload");
        };
        assert_eq!(last.size as usize, 500 - CHUNK_PAYLOAD_SIZE);
        assert!(last.is_connected);
    }

    #[test]
    fn empty_frame_yields_one_empty_message() {
        let chunks = assemble_frame(&[], 0.1).unwrap();
        assert_eq!(chunks.data.len(), 1);
        assert_eq!(chunks.ecc.len(), 1);
        assert_eq!(chunks.data[0].header.msg_count, 1);

        let ChunkPayload::Data(payload) = &chunks.data[0].payload else {
            panic!("expected data payload");
        };
        assert_eq!(payload.size, 0);
    }

    #[test]
    fn multi_message_frame() {
        // 76,800 bytes: one full message (127 chunks) + 14,062 bytes
        // (29 chunks).
        let frame: Vec<u8> = (0..=255u8).cycle().take(300 * 256).collect();
        let chunks = assemble_frame(&frame, 0.1).unwrap();

        assert_eq!(chunks.data.len(), 127 + 29);
        assert!(chunks.ecc.len() >= 2);
        assert!(chunks.data.iter().all(|c| c.header.msg_count == 2));
        assert_eq!(
            chunks.data.iter().filter(|c| c.header.msg_index == 1).count(),
            29
        );
    }

    #[test]
    fn full_message_boundary() {
        let frame = vec![7u8; MAX_MESSAGE_SIZE];
        let chunks = assemble_frame(&frame, 0.0).unwrap();
        assert_eq!(chunks.data.len(), 127);
        assert_eq!(chunks.ecc.len(), 1);
        assert!(chunks.data.iter().all(|c| c.header.msg_count == 1));
    }

    #[test]
    fn parity_count_follows_ratio() {
        let frame = vec![1u8; CHUNK_PAYLOAD_SIZE * 20];
        let chunks = assemble_frame(&frame, 0.25).unwrap();
        assert_eq!(chunks.data.len(), 20);
        assert_eq!(chunks.ecc.len(), 5);
    }

    #[test]
    fn interleaving_spreads_parity() {
        let frame = vec![1u8; CHUNK_PAYLOAD_SIZE * 10];
        let chunks = assemble_frame(&frame, 0.2).unwrap();
        assert_eq!(chunks.data.len(), 10);
        assert_eq!(chunks.ecc.len(), 2);

        let order = chunks.interleaved();
        assert_eq!(order.len(), 12);
        // First slot carries parity, the rest follows the step.
        assert!(order[0].is_ecc());
        assert_eq!(order.iter().filter(|c| c.is_ecc()).count(), 2);
        // Every chunk is emitted exactly once.
        assert_eq!(order.iter().filter(|c| !c.is_ecc()).count(), 10);
    }

    #[test]
    fn interleaving_flushes_excess_parity() {
        let frame = vec![1u8; 100];
        let chunks = assemble_frame(&frame, 1.0).unwrap();
        assert_eq!(chunks.data.len(), 1);
        assert_eq!(chunks.ecc.len(), 1);

        let order = chunks.interleaved();
        assert_eq!(order.len(), 2);
    }
}
