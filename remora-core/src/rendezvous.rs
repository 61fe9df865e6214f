//! Rendezvous proxy: NAT-traversal pairing and datagram forwarding.
//!
//! Two peers sending under the same 48-bit session id meet here. The
//! proxy mirrors their pings back with the observed public endpoint,
//! marks the session established once a second distinct sender checks
//! in, and from then on forwards data datagrams verbatim between the
//! pair. Only the session-id prefix of a datagram is inspected for
//! routing.
//!
//! A TCP listener on the same port answers any connection with a
//! fixed HTTP/200 body advertising the server id, so clients probing
//! whether an address is a rendezvous server get a deterministic,
//! CORS-friendly answer.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::chunk::{CHUNK_SIZE, Chunk, ChunkPayload, ControlPayload, UdpCommand};
use crate::error::TransportError;

/// Sessions tracked before the table is cleared wholesale.
pub const SESSION_TABLE_CAPACITY: usize = 5_000;

/// Advertised in the HTTP discovery body.
pub const SERVER_ID: &str = "7c9e4b2a-0d31-4f66-9a58-3be1c07d2f41";

/// Largest request the discovery responder will drain.
const HTTP_REQUEST_LIMIT: usize = 128 * 1024;

// ── IdMapping ────────────────────────────────────────────────────

/// Pairing state for one session id.
#[derive(Debug, Clone, Copy, Default)]
struct IdMapping {
    /// Both endpoints have checked in.
    is_valid: bool,
    source_addr: Option<SocketAddr>,
    target_addr: Option<SocketAddr>,
}

// ── RendezvousServer ─────────────────────────────────────────────

/// The rendezvous server: one UDP forwarding task plus one HTTP
/// discovery task, both bound to the same port.
pub struct RendezvousServer {
    socket: UdpSocket,
    http: TcpListener,
    local_addr: SocketAddr,
}

impl RendezvousServer {
    /// Bind the UDP service and the TCP discovery listener on
    /// `address` (e.g. `0.0.0.0:41988`; port 0 picks one).
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(address).await?;
        let local_addr = socket.local_addr()?;
        let http = TcpListener::bind(local_addr).await?;

        Ok(Self {
            socket,
            http,
            local_addr,
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("rendezvous server listening on {}", self.local_addr);

        let http_shutdown = shutdown.clone();
        let http_task = tokio::spawn(discovery_loop(self.http, http_shutdown));

        let mut mappings: HashMap<u64, IdMapping> = HashMap::new();
        let mut buf = [0u8; CHUNK_SIZE];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, sender)) if len == CHUNK_SIZE => {
                    handle_datagram(&self.socket, &mut mappings, &buf[..len], sender).await;
                }
                Ok((len, sender)) => {
                    tracing::debug!("ignoring {len}-byte datagram from {sender}");
                }
                Err(e) => {
                    tracing::warn!("could not read from socket: {e}");
                }
            }
        }

        let _ = http_task.await;
        tracing::debug!("rendezvous server terminated");
    }
}

/// Apply the per-datagram pairing and forwarding rule.
async fn handle_datagram(
    socket: &UdpSocket,
    mappings: &mut HashMap<u64, IdMapping>,
    datagram: &[u8],
    sender: SocketAddr,
) {
    if mappings.len() > SESSION_TABLE_CAPACITY {
        tracing::warn!("session table overflow; clearing {} entries", mappings.len());
        mappings.clear();
    }

    let Some(session_id) = Chunk::peek_session_id(datagram) else {
        return;
    };

    if !mappings.contains_key(&session_id) {
        tracing::debug!("starting new pairing for '{sender}'");
        mappings.insert(
            session_id,
            IdMapping {
                is_valid: false,
                source_addr: Some(sender),
                target_addr: None,
            },
        );
        return;
    }

    let chunk = match Chunk::decode(datagram) {
        Ok(chunk) => chunk,
        Err(_) => return,
    };

    if let ChunkPayload::Control(ctrl) = &chunk.payload {
        if ctrl.command == UdpCommand::Ping {
            if let Some(mapping) = mappings.get_mut(&session_id) {
                handle_ping(socket, mapping, chunk.clone(), sender).await;
            }
        }
        return;
    }

    // Data and parity chunks are forwarded verbatim to the opposite
    // endpoint of an established pair.
    let Some(mapping) = mappings.get(&session_id).copied() else {
        return;
    };

    if !mapping.is_valid {
        mappings.remove(&session_id);
        return;
    }

    let target = if mapping.source_addr == Some(sender) {
        mapping.target_addr
    } else if mapping.target_addr == Some(sender) {
        mapping.source_addr
    } else {
        // A third sender on an established session invalidates it.
        mappings.remove(&session_id);
        return;
    };

    if let Some(target) = target {
        if let Err(e) = socket.send_to(datagram, target).await {
            tracing::debug!("forward to {target} failed: {e}");
        }
    }
}

/// Mirror a ping back to its sender, pairing the session when a
/// second distinct endpoint checks in.
async fn handle_ping(
    socket: &UdpSocket,
    mapping: &mut IdMapping,
    mut chunk: Chunk,
    sender: SocketAddr,
) {
    // The reply tells the sender how the world sees it. The
    // established flag carries the mapping state *before* this ping
    // so pairing is only ever announced to a peer that pinged again.
    let mut reply = ControlPayload::ping();
    reply.is_link_established = mapping.is_valid;
    reply.your_address = sender.ip().to_string();
    reply.your_port = sender.port() as i32;

    if !mapping.is_valid && mapping.source_addr != Some(sender) {
        mapping.target_addr = Some(sender);
        mapping.is_valid = true;
    }

    if mapping.is_valid {
        let peer = if mapping.source_addr == Some(sender) {
            mapping.target_addr
        } else {
            mapping.source_addr
        };
        if let Some(peer) = peer {
            reply.peer_address = peer.ip().to_string();
            reply.peer_port = peer.port() as i32;
        }
        tracing::debug!(
            "processing ping from '{sender}', paired with '{}:{}'",
            reply.peer_address,
            reply.peer_port
        );
    } else {
        tracing::debug!("processing ping from '{sender}', waiting for peer to connect...");
    }

    chunk.payload = ChunkPayload::Control(reply);
    if let Err(e) = socket.send_to(&chunk.encode(), sender).await {
        tracing::debug!("ping reply to {sender} failed: {e}");
    }
}

// ── HTTP discovery ───────────────────────────────────────────────

/// Fixed HTTP response advertising the server id.
fn discovery_response() -> String {
    let body = serde_json::json!({ "id": SERVER_ID }).to_string();
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

async fn discovery_loop(listener: TcpListener, shutdown: CancellationToken) {
    let response = discovery_response();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("discovery request from {peer}");
                let response = response.clone();
                tokio::spawn(async move {
                    let _ = answer_discovery(stream, &response).await;
                });
            }
            Err(e) => {
                tracing::warn!("could not accept discovery connection: {e}");
            }
        }
    }
}

async fn answer_discovery(mut stream: TcpStream, response: &str) -> std::io::Result<()> {
    // Drain (and discard) one read of the request, then answer.
    let mut request = vec![0u8; HTTP_REQUEST_LIMIT];
    let _ = stream.read(&mut request).await?;

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

// ── Tests ────────────────────────────────────────────────────────
