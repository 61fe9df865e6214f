//! Remora wire chunk — 512 bytes, little-endian, bit-packed header.
//!
//! ```text
//! Offset  Size   Field
//! ──────  ─────  ──────────────
//!   0       8    word 0:
//!                  bits  0..48  session_id   (routes at the proxy)
//!                  bit   48     is_ecc
//!                  bit   49     is_control
//!                  bits 50..57  chunk_index  (position in message)
//!                  bits 57..64  chunk_count
//!   8       8    word 1:
//!                  bits  0..48  tracking_id  (correlates one frame)
//!                  bits 48..56  msg_index    (position in frame)
//!                  bits 56..64  msg_count
//!  16     496    payload — one of three variants:
//!                  data:    u16 (15-bit size, top bit is_connected)
//!                           + 494 payload bytes
//!                  ecc:     496 parity bytes
//!                  control: command i32, is_link_established u8,
//!                           peer_address [u8; 32], peer_port i32,
//!                           your_address [u8; 32], your_port i32,
//!                           zero padding
//! ──────  ─────  ──────────────
//! Total:  512 bytes
//! ```
//!
//! The session id must occupy the first six bytes: the rendezvous
//! proxy routes datagrams on a prefix read without decoding the rest.
//!
//! The 496-byte payload region of a data chunk doubles as its erasure
//! shard, so the parity code covers the size prefix along with the
//! payload bytes. A data chunk recovered from parity therefore carries
//! a valid tail length.

use bytes::{Buf, BufMut};

use crate::error::TransportError;

/// Fixed size of one chunk on the wire.
pub const CHUNK_SIZE: usize = 512;

/// Size of one erasure shard (the payload region). Must be a multiple
/// of 8 for the GF(2⁸) coder.
pub const CHUNK_ECC_SIZE: usize = CHUNK_SIZE - 16;

/// Usable payload bytes per data chunk.
pub const CHUNK_PAYLOAD_SIZE: usize = CHUNK_SIZE - 18;

/// Chunks per message are capped by the 7-bit chunk index.
pub const MAX_CHUNKS_PER_MESSAGE: usize = 127;

/// Maximum byte length of one message.
pub const MAX_MESSAGE_SIZE: usize = CHUNK_PAYLOAD_SIZE * MAX_CHUNKS_PER_MESSAGE;

/// Session and tracking identifiers are 48-bit on the wire.
pub const ID_MASK: u64 = (1 << 48) - 1;

const _: () = assert!(CHUNK_ECC_SIZE % 8 == 0);

// ── UdpCommand ───────────────────────────────────────────────────

/// Command codes carried by control chunks.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpCommand {
    Ping = 0,
    LinkStatus = 1,
}

impl TryFrom<i32> for UdpCommand {
    type Error = TransportError;

    fn try_from(value: i32) -> Result<Self, TransportError> {
        match value {
            0 => Ok(UdpCommand::Ping),
            1 => Ok(UdpCommand::LinkStatus),
            other => Err(TransportError::UnknownVariant {
                type_name: "UdpCommand",
                value: other as u64,
            }),
        }
    }
}

// ── ChunkHeader ──────────────────────────────────────────────────

/// The bit-packed 16-byte header shared by all chunk variants.
///
/// `session_id` and `tracking_id` are masked to 48 bits on encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Pairs two peers at the rendezvous proxy.
    pub session_id: u64,
    /// Correlates all chunks of one frame; chosen by the sender.
    pub tracking_id: u64,
    /// Position within the enclosing message.
    pub chunk_index: u8,
    /// Chunks in the enclosing message (data and parity count
    /// separately).
    pub chunk_count: u8,
    /// Position within the enclosing frame.
    pub msg_index: u8,
    /// Messages in the enclosing frame.
    pub msg_count: u8,
}

// ── Payload variants ─────────────────────────────────────────────

/// Payload of a data chunk: length-prefixed message bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DataPayload {
    /// Valid byte count in `bytes` (15-bit; only meaningful below
    /// [`CHUNK_PAYLOAD_SIZE`] on the last chunk of a message).
    pub size: u16,
    /// Set on every chunk of an established stream.
    pub is_connected: bool,
    pub bytes: [u8; CHUNK_PAYLOAD_SIZE],
}

impl DataPayload {
    /// An empty, connected data payload.
    pub fn empty() -> Self {
        Self {
            size: 0,
            is_connected: true,
            bytes: [0u8; CHUNK_PAYLOAD_SIZE],
        }
    }

    /// The 496-byte erasure shard covering this chunk: the size
    /// prefix followed by the payload bytes.
    pub fn shard(&self) -> Vec<u8> {
        let mut shard = Vec::with_capacity(CHUNK_ECC_SIZE);
        shard.put_u16_le(self.prefix());
        shard.extend_from_slice(&self.bytes);
        shard
    }

    /// Rebuild a data payload from a recovered erasure shard.
    pub fn from_shard(shard: &[u8]) -> Result<Self, TransportError> {
        if shard.len() != CHUNK_ECC_SIZE {
            return Err(TransportError::InvalidChunkLength {
                expected: CHUNK_ECC_SIZE,
                actual: shard.len(),
            });
        }
        let mut buf = shard;
        let prefix = buf.get_u16_le();
        let mut bytes = [0u8; CHUNK_PAYLOAD_SIZE];
        buf.copy_to_slice(&mut bytes);
        Ok(Self {
            size: prefix & 0x7FFF,
            is_connected: prefix & 0x8000 != 0,
            bytes,
        })
    }

    fn prefix(&self) -> u16 {
        (self.size & 0x7FFF) | ((self.is_connected as u16) << 15)
    }
}

impl std::fmt::Debug for DataPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPayload")
            .field("size", &self.size)
            .field("is_connected", &self.is_connected)
            .finish()
    }
}

/// Payload of a parity chunk.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EccPayload {
    pub bytes: [u8; CHUNK_ECC_SIZE],
}

impl EccPayload {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0u8; CHUNK_ECC_SIZE],
        }
    }
}

impl std::fmt::Debug for EccPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EccPayload").finish()
    }
}

/// Payload of a control chunk: handshake command plus the two
/// endpoint tuples the proxy reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPayload {
    pub command: UdpCommand,
    /// Set by the proxy once both peers of a session have checked in.
    pub is_link_established: bool,
    /// The *other* endpoint of the session, as observed by the proxy.
    pub peer_address: String,
    pub peer_port: i32,
    /// The receiving endpoint's own public address, as observed.
    pub your_address: String,
    pub your_port: i32,
}

impl ControlPayload {
    /// Addresses are carried as fixed 32-byte NUL-padded strings.
    const ADDRESS_SIZE: usize = 32;

    /// A ping with empty address fields, as sent by a connecting
    /// endpoint.
    pub fn ping() -> Self {
        Self {
            command: UdpCommand::Ping,
            is_link_established: false,
            peer_address: String::new(),
            peer_port: 0,
            your_address: String::new(),
            your_port: 0,
        }
    }

    fn put_address(buf: &mut impl BufMut, address: &str) {
        let mut field = [0u8; Self::ADDRESS_SIZE];
        let raw = address.as_bytes();
        // leave at least one trailing NUL
        let len = raw.len().min(Self::ADDRESS_SIZE - 1);
        field[..len].copy_from_slice(&raw[..len]);
        buf.put_slice(&field);
    }

    fn get_address(buf: &mut impl Buf) -> String {
        let mut field = [0u8; Self::ADDRESS_SIZE];
        buf.copy_to_slice(&mut field);
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

/// One of the three chunk payload variants. The variant also supplies
/// the two discriminator bits of header word 0.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    Data(DataPayload),
    Ecc(EccPayload),
    Control(ControlPayload),
}

// ── Chunk ────────────────────────────────────────────────────────

/// One 512-byte UDP datagram payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: ChunkPayload,
}

impl Chunk {
    /// A handshake ping, ready for session stamping.
    pub fn ping() -> Self {
        Self {
            header: ChunkHeader::default(),
            payload: ChunkPayload::Control(ControlPayload::ping()),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.payload, ChunkPayload::Control(_))
    }

    pub fn is_ecc(&self) -> bool {
        matches!(self.payload, ChunkPayload::Ecc(_))
    }

    // ── Serialization ────────────────────────────────────────────

    /// Serialize to exactly [`CHUNK_SIZE`] bytes (little-endian).
    pub fn encode(&self) -> [u8; CHUNK_SIZE] {
        let mut out = [0u8; CHUNK_SIZE];
        let mut buf = &mut out[..];

        let mut word0 = self.header.session_id & ID_MASK;
        match &self.payload {
            ChunkPayload::Data(_) => {}
            ChunkPayload::Ecc(_) => word0 |= 1 << 48,
            ChunkPayload::Control(_) => word0 |= 1 << 49,
        }
        word0 |= ((self.header.chunk_index as u64) & 0x7F) << 50;
        word0 |= ((self.header.chunk_count as u64) & 0x7F) << 57;
        buf.put_u64_le(word0);

        let mut word1 = self.header.tracking_id & ID_MASK;
        word1 |= (self.header.msg_index as u64) << 48;
        word1 |= (self.header.msg_count as u64) << 56;
        buf.put_u64_le(word1);

        match &self.payload {
            ChunkPayload::Data(data) => {
                buf.put_u16_le(data.prefix());
                buf.put_slice(&data.bytes);
            }
            ChunkPayload::Ecc(ecc) => {
                buf.put_slice(&ecc.bytes);
            }
            ChunkPayload::Control(ctrl) => {
                buf.put_i32_le(ctrl.command as i32);
                buf.put_u8(ctrl.is_link_established as u8);
                ControlPayload::put_address(&mut buf, &ctrl.peer_address);
                buf.put_i32_le(ctrl.peer_port);
                ControlPayload::put_address(&mut buf, &ctrl.your_address);
                buf.put_i32_le(ctrl.your_port);
                // remainder stays zero
            }
        }

        out
    }

    /// Deserialize from exactly [`CHUNK_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() != CHUNK_SIZE {
            return Err(TransportError::InvalidChunkLength {
                expected: CHUNK_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let word0 = buf.get_u64_le();
        let word1 = buf.get_u64_le();

        let header = ChunkHeader {
            session_id: word0 & ID_MASK,
            tracking_id: word1 & ID_MASK,
            chunk_index: ((word0 >> 50) & 0x7F) as u8,
            chunk_count: ((word0 >> 57) & 0x7F) as u8,
            msg_index: (word1 >> 48) as u8,
            msg_count: (word1 >> 56) as u8,
        };

        let is_ecc = word0 & (1 << 48) != 0;
        let is_control = word0 & (1 << 49) != 0;

        let payload = if is_control {
            let command = UdpCommand::try_from(buf.get_i32_le())?;
            let is_link_established = buf.get_u8() != 0;
            let peer_address = ControlPayload::get_address(&mut buf);
            let peer_port = buf.get_i32_le();
            let your_address = ControlPayload::get_address(&mut buf);
            let your_port = buf.get_i32_le();
            ChunkPayload::Control(ControlPayload {
                command,
                is_link_established,
                peer_address,
                peer_port,
                your_address,
                your_port,
            })
        } else if is_ecc {
            let mut shard = [0u8; CHUNK_ECC_SIZE];
            buf.copy_to_slice(&mut shard);
            ChunkPayload::Ecc(EccPayload { bytes: shard })
        } else {
            let prefix = buf.get_u16_le();
            let mut payload = [0u8; CHUNK_PAYLOAD_SIZE];
            buf.copy_to_slice(&mut payload);
            ChunkPayload::Data(DataPayload {
                size: prefix & 0x7FFF,
                is_connected: prefix & 0x8000 != 0,
                bytes: payload,
            })
        };

        Ok(Self { header, payload })
    }

    /// Read the session id from a raw datagram without decoding it.
    ///
    /// This is all the rendezvous proxy needs for routing.
    pub fn peek_session_id(datagram: &[u8]) -> Option<u64> {
        if datagram.len() < 8 {
            return None;
        }
        let word0 = u64::from_le_bytes(datagram[..8].try_into().ok()?);
        Some(word0 & ID_MASK)
    }
}

// ── Tests ────────────────────────────────────────────────────────
