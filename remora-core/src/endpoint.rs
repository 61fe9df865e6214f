//! Session-paired UDP transport endpoint.
//!
//! An endpoint binds an ephemeral socket, rendezvouses with its peer
//! through the proxy by pinging every 333 ms, then streams frames as
//! interleaved data + parity chunks. Three tasks cooperate:
//!
//! - the owner's task calls [`UdpEndpoint::send_frame`];
//! - a background *receive* task drives the handshake and feeds the
//!   frame assembler, invoking the frame handler on completion;
//! - a background *watchdog* task drops the link when no datagram has
//!   arrived for a full check interval.
//!
//! The receive task owns the reassembly tables exclusively; metrics
//! sit behind a mutex and readers tolerate stale values.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembly::{FrameAssembler, assemble_frame};
use crate::chunk::{CHUNK_SIZE, Chunk, ChunkPayload, ControlPayload, ID_MASK, UdpCommand};
use crate::error::TransportError;
use crate::metrics::ConnectionMetrics;
use crate::options::parse_socket_addr;
use crate::state::{LinkState, LinkStateCell};

/// Handshake ping cadence.
const PING_INTERVAL: Duration = Duration::from_millis(333);

/// Pings sent before giving up on the proxy.
const PING_RETRIES: u32 = 10;

/// Backoff after a malformed or failed socket read.
const RECV_BACKOFF: Duration = Duration::from_millis(33);

/// Liveness check cadence.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

// ── EndpointOptions ──────────────────────────────────────────────

/// Tuning knobs for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Target parity chunks per data chunk.
    pub ecc_ratio: f32,
    /// Disable the liveness watchdog (useful for idle links and
    /// tests).
    pub disable_watchdog: bool,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            ecc_ratio: 0.1,
            disable_watchdog: false,
        }
    }
}

/// Invoked on the receive task with each completed frame.
pub type FrameHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

// ── UdpEndpoint ──────────────────────────────────────────────────

/// One side of a session-paired UDP link.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    remote: std::net::SocketAddr,
    session_id: u64,
    ecc_ratio: f32,
    state: Arc<LinkStateCell>,
    metrics: Arc<Mutex<ConnectionMetrics>>,
    shutdown: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEndpoint {
    /// Connect to the rendezvous proxy at `address` and pair under
    /// `session_id`.
    ///
    /// Pings flow every 333 ms: at least [`PING_RETRIES`] attempts,
    /// and indefinitely while the proxy has answered but the peer has
    /// not. `on_frame` runs on the receive task for every completed
    /// frame; panics in it are caught and logged.
    pub async fn connect(
        address: &str,
        session_id: u64,
        options: EndpointOptions,
        on_frame: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Result<Self, TransportError> {
        tracing::info!("connecting to '{address}'...");
        let remote = parse_socket_addr(address)?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let state = Arc::new(LinkStateCell::new(LinkState::WaitingForProxy));
        let metrics = Arc::new(Mutex::new(ConnectionMetrics::default()));
        let shutdown = CancellationToken::new();

        let recv_task = tokio::spawn(receive_loop(
            Arc::clone(&socket),
            Arc::clone(&state),
            Arc::clone(&metrics),
            shutdown.clone(),
            Box::new(on_frame),
        ));

        let endpoint = Self {
            socket,
            remote,
            session_id: session_id & ID_MASK,
            ecc_ratio: options.ecc_ratio,
            state,
            metrics,
            shutdown,
            recv_task: Mutex::new(Some(recv_task)),
            watchdog_task: Mutex::new(None),
        };

        let mut attempt = 0u32;
        while (attempt < PING_RETRIES || endpoint.state.load() == LinkState::WaitingForPeer)
            && !endpoint.state.load().is_connected()
        {
            endpoint.send_chunk(Chunk::ping(), 0).await;
            tokio::time::sleep(PING_INTERVAL).await;
            attempt += 1;
        }

        if !endpoint.state.load().is_connected() {
            endpoint.disconnect().await;
            return Err(TransportError::HandshakeTimeout {
                address: address.to_string(),
            });
        }

        if !options.disable_watchdog {
            let watchdog = tokio::spawn(watchdog_loop(
                Arc::clone(&endpoint.state),
                Arc::clone(&endpoint.metrics),
                endpoint.shutdown.clone(),
            ));
            *lock(&endpoint.watchdog_task) = Some(watchdog);
        }

        Ok(endpoint)
    }

    /// Packetize and transmit one frame under `tracking_id`.
    ///
    /// Parity is interleaved into the data stream; individual send
    /// failures are logged and otherwise ignored (UDP best effort).
    pub async fn send_frame(&self, bytes: &[u8], tracking_id: u64) -> Result<(), TransportError> {
        let chunks = assemble_frame(bytes, self.ecc_ratio)?;
        for chunk in chunks.interleaved() {
            self.send_chunk(chunk.clone(), tracking_id).await;
        }
        Ok(())
    }

    async fn send_chunk(&self, mut chunk: Chunk, tracking_id: u64) {
        chunk.header.session_id = self.session_id;
        chunk.header.tracking_id = tracking_id & ID_MASK;
        if let Err(e) = self.socket.send_to(&chunk.encode(), self.remote).await {
            tracing::debug!("send to {} failed: {e}", self.remote);
        }
    }

    /// Tear the link down and join the background tasks.
    ///
    /// Safe to call repeatedly. The watchdog transitions through the
    /// same state/token pair without joining itself.
    pub async fn disconnect(&self) {
        self.state.store(LinkState::Disconnected);
        self.shutdown.cancel();

        let recv_handle = lock(&self.recv_task).take();
        if let Some(handle) = recv_handle {
            tracing::debug!("waiting for receive task to terminate...");
            let _ = handle.await;
        }
        let watchdog_handle = lock(&self.watchdog_task).take();
        if let Some(handle) = watchdog_handle {
            tracing::debug!("waiting for watchdog task to terminate...");
            let _ = handle.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.load().is_connected()
    }

    pub fn state(&self) -> LinkState {
        self.state.load()
    }

    /// Snapshot of the connection metrics (possibly one packet
    /// stale).
    pub fn metrics(&self) -> ConnectionMetrics {
        *lock(&self.metrics)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.state.store(LinkState::Disconnected);
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("remote", &self.remote)
            .field("session_id", &self.session_id)
            .field("state", &self.state.load())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Background tasks ─────────────────────────────────────────────

async fn receive_loop(
    socket: Arc<UdpSocket>,
    state: Arc<LinkStateCell>,
    metrics: Arc<Mutex<ConnectionMetrics>>,
    shutdown: CancellationToken,
    on_frame: FrameHandler,
) {
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; CHUNK_SIZE];

    while !state.load().is_disconnected() {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };

        match received {
            Ok((len, _sender)) if len == CHUNK_SIZE => {
                let chunk = match Chunk::decode(&buf[..len]) {
                    Ok(chunk) => chunk,
                    Err(_) => {
                        lock(&metrics).invalid_packets += 1;
                        continue;
                    }
                };

                if let ChunkPayload::Control(ctrl) = &chunk.payload {
                    handle_control(&state, ctrl);
                } else if state.load().is_connected() {
                    let completed = {
                        let mut m = lock(&metrics);
                        m.incoming_packets += 1;
                        assembler.process(&chunk, &mut m)
                    };

                    if let Some(frame) = completed {
                        let call = std::panic::AssertUnwindSafe(|| on_frame(frame));
                        if std::panic::catch_unwind(call).is_err() {
                            tracing::error!("panic in user-supplied frame handler");
                        }
                    }
                } else {
                    tracing::debug!("ignoring data chunk while not connected");
                }
            }
            Ok((len, _sender)) => {
                tracing::warn!("dropping malformed datagram of {len} bytes");
                tokio::time::sleep(RECV_BACKOFF).await;
            }
            Err(e) => {
                if state.load().is_disconnected() || shutdown.is_cancelled() {
                    break;
                }
                tracing::warn!("could not read from socket: {e}");
                tokio::time::sleep(RECV_BACKOFF).await;
            }
        }
    }

    tracing::debug!("receive task terminated");
}

fn handle_control(state: &LinkStateCell, ctrl: &ControlPayload) {
    match state.load() {
        LinkState::Connected => {
            tracing::warn!("received control packet while connected");
        }
        LinkState::WaitingForPeer => {
            if ctrl.command == UdpCommand::Ping {
                if ctrl.is_link_established {
                    tracing::debug!(
                        "connection to peer '{}:{}' established",
                        ctrl.peer_address,
                        ctrl.peer_port
                    );
                    state.transition(LinkState::WaitingForPeer, LinkState::Connected);
                }
            } else {
                tracing::warn!("received a non-ping while waiting for peer");
            }
        }
        LinkState::WaitingForProxy => {
            if ctrl.command == UdpCommand::Ping {
                tracing::debug!(
                    "proxy responded; public address is '{}:{}', waiting for peer...",
                    ctrl.your_address,
                    ctrl.your_port
                );
                state.transition(LinkState::WaitingForProxy, LinkState::WaitingForPeer);
            } else {
                tracing::warn!("received a non-ping while waiting for proxy");
            }
        }
        LinkState::Disconnected => {}
    }
}

async fn watchdog_loop(
    state: Arc<LinkStateCell>,
    metrics: Arc<Mutex<ConnectionMetrics>>,
    shutdown: CancellationToken,
) {
    let mut last_count = 0i64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
        }

        if state.load().is_disconnected() {
            break;
        }

        let incoming = lock(&metrics).incoming_packets;
        if incoming == last_count {
            tracing::warn!("no incoming packets since last check; disconnecting");
            // Cancel instead of joining: this task must not await its
            // own handle.
            state.store(LinkState::Disconnected);
            shutdown.cancel();
            break;
        }
        last_count = incoming;
    }

    tracing::debug!("watchdog task terminated");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    /// Minimal loopback proxy: answers every ping with the sender's
    /// observed endpoint and, optionally, an established link.
    async fn spawn_mini_proxy(establish: bool) -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; CHUNK_SIZE];
            while let Ok((len, sender)) = socket.recv_from(&mut buf).await {
                let Ok(chunk) = Chunk::decode(&buf[..len]) else {
                    continue;
                };
                if !chunk.is_control() {
                    continue;
                }

                let mut reply = chunk.clone();
                reply.payload = ChunkPayload::Control(ControlPayload {
                    command: UdpCommand::Ping,
                    is_link_established: establish,
                    peer_address: sender.ip().to_string(),
                    peer_port: sender.port() as i32,
                    your_address: sender.ip().to_string(),
                    your_port: sender.port() as i32,
                });
                let _ = socket.send_to(&reply.encode(), sender).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn handshake_reaches_connected() {
        let proxy = spawn_mini_proxy(true).await;

        let endpoint = UdpEndpoint::connect(
            &proxy.to_string(),
            42,
            EndpointOptions {
                disable_watchdog: true,
                ..EndpointOptions::default()
            },
            |_frame| {},
        )
        .await;

        let endpoint = assert_ok!(endpoint);
        assert!(endpoint.is_connected());
        assert_eq!(endpoint.session_id(), 42);
        endpoint.disconnect().await;
        assert!(endpoint.state().is_disconnected());
    }

    #[tokio::test]
    async fn handshake_without_establishment_stalls_in_waiting_for_peer() {
        let proxy = spawn_mini_proxy(false).await;

        // The connect loop pings forever while waiting for the peer;
        // bound it from the outside like the harness does.
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            UdpEndpoint::connect(
                &proxy.to_string(),
                7,
                EndpointOptions::default(),
                |_frame| {},
            ),
        )
        .await;

        assert!(result.is_err(), "connect should still be waiting");
    }

    #[tokio::test]
    async fn handshake_times_out_without_proxy() {
        // Nothing listens here; after ten pings connect gives up.
        let result = UdpEndpoint::connect(
            "127.0.0.1:1",
            9,
            EndpointOptions::default(),
            |_frame| {},
        )
        .await;

        assert!(matches!(
            result,
            Err(TransportError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_address_rejected() {
        let result =
            UdpEndpoint::connect("not-an-address", 1, EndpointOptions::default(), |_| {}).await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }

    #[test]
    fn control_transitions() {
        let state = LinkStateCell::new(LinkState::WaitingForProxy);
        let mut ctrl = ControlPayload::ping();

        handle_control(&state, &ctrl);
        assert_eq!(state.load(), LinkState::WaitingForPeer);

        // Without the established flag the state holds.
        handle_control(&state, &ctrl);
        assert_eq!(state.load(), LinkState::WaitingForPeer);

        ctrl.is_link_established = true;
        handle_control(&state, &ctrl);
        assert!(state.load().is_connected());
    }
}
