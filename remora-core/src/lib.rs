//! # remora-core
//!
//! Transport core for the Remora low-latency remote-desktop system.
//!
//! This crate contains:
//! - **Chunk codec**: the 512-byte bit-packed wire record with data,
//!   parity and control variants
//! - **Assembly**: frame → chunk packetization with Reed–Solomon
//!   parity, and the message/frame reassembly state machines
//! - **Endpoint**: `UdpEndpoint` — socket lifecycle, rendezvous
//!   handshake, receive loop and liveness watchdog
//! - **Rendezvous**: `RendezvousServer` — per-session NAT-traversal
//!   pairing, datagram forwarding and HTTP discovery
//! - **Response**: the viewer→host back-channel codec with duplicate
//!   suppression and embedded profiling
//! - **Perf**: `PerfProbe` — the end-to-end frame timing probe
//! - **Options**: parsed program configuration and protocol strings
//! - **Error**: `TransportError` — typed, `thiserror`-based errors

pub mod assembly;
pub mod chunk;
pub mod endpoint;
pub mod erasure;
pub mod error;
pub mod metrics;
pub mod options;
pub mod perf;
pub mod rendezvous;
pub mod response;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use assembly::{FrameAssembler, FrameChunks, MessageAssembler, assemble_frame};
pub use chunk::{
    CHUNK_ECC_SIZE, CHUNK_PAYLOAD_SIZE, CHUNK_SIZE, Chunk, ChunkHeader, ChunkPayload,
    MAX_MESSAGE_SIZE, UdpCommand,
};
pub use endpoint::{EndpointOptions, UdpEndpoint};
pub use error::TransportError;
pub use metrics::ConnectionMetrics;
pub use options::{ProgramOptions, ProtocolString, parse_socket_addr};
pub use perf::{PerfMetric, PerfProbe};
pub use rendezvous::RendezvousServer;
pub use response::{ResponseDecoder, ResponseEncoder, ResponseListener};
pub use state::LinkState;
