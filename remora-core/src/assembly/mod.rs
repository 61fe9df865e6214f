//! Packetization and reassembly.
//!
//! Sender side: [`packet::assemble_frame`] cuts a frame into
//! size-capped messages and erasure-protected chunks. Receiver side:
//! [`frame::FrameAssembler`] (which owns per-message
//! [`message::MessageAssembler`]s) rebuilds frames from the lossy,
//! unordered chunk stream.

pub mod frame;
pub mod message;
pub mod packet;

pub use frame::{FRAME_TABLE_CAPACITY, FrameAssembler};
pub use message::{MESSAGE_TABLE_CAPACITY, MessageAssembler};
pub use packet::{FrameChunks, assemble_frame};
