//! Integration tests — full rendezvous pairing, frame streaming and
//! back-channel round-trips over real UDP sockets on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use remora_core::response::{ResponseDecoder, ResponseEncoder, ResponseListener};
use remora_core::{EndpointOptions, LinkState, RendezvousServer, UdpEndpoint};

// ── Helpers ──────────────────────────────────────────────────────

/// Spin up a rendezvous server on an OS-assigned port and return its
/// address plus the shutdown token.
async fn spawn_rendezvous() -> (String, CancellationToken) {
    let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().to_string();
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move { server.run(run_token).await });
    (addr, token)
}

fn quiet_options() -> EndpointOptions {
    EndpointOptions {
        disable_watchdog: true,
        ..EndpointOptions::default()
    }
}

/// Connect two endpoints under the same session id; the second one
/// starts slightly later, like a viewer joining a waiting host.
async fn connect_pair(
    addr: &str,
    session_id: u64,
    on_frame_a: impl Fn(Vec<u8>) + Send + Sync + 'static,
    on_frame_b: impl Fn(Vec<u8>) + Send + Sync + 'static,
) -> (UdpEndpoint, UdpEndpoint) {
    let addr_a = addr.to_string();
    let a = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_a, session_id, quiet_options(), on_frame_a).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let addr_b = addr.to_string();
    let b = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_b, session_id, quiet_options(), on_frame_b).await
    });

    let a = tokio::time::timeout(Duration::from_secs(10), a)
        .await
        .expect("host connect timed out")
        .unwrap()
        .expect("host connect failed");
    let b = tokio::time::timeout(Duration::from_secs(10), b)
        .await
        .expect("viewer connect timed out")
        .unwrap()
        .expect("viewer connect failed");

    (a, b)
}

// ── Pairing ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_same_session_pairs_and_connects() {
    let (addr, token) = spawn_rendezvous().await;

    let (a, b) = connect_pair(&addr, 42, |_| {}, |_| {}).await;
    assert!(a.is_connected());
    assert!(b.is_connected());

    a.disconnect().await;
    b.disconnect().await;
    assert_eq!(a.state(), LinkState::Disconnected);
    token.cancel();
}

#[tokio::test]
async fn test_mismatched_sessions_never_connect() {
    let (addr, token) = spawn_rendezvous().await;

    let addr_a = addr.clone();
    let a = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_a, 1, quiet_options(), |_| {}).await
    });
    let addr_b = addr.clone();
    let b = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_b, 2, quiet_options(), |_| {}).await
    });

    // Each endpoint reaches WaitingForPeer and stays there; bound the
    // wait from the outside.
    let raced = tokio::time::timeout(Duration::from_secs(3), async {
        let _ = a.await;
        let _ = b.await;
    })
    .await;
    assert!(raced.is_err(), "mismatched sessions must never pair");

    token.cancel();
}

// ── Frame streaming ──────────────────────────────────────────────

#[tokio::test]
async fn test_frame_roundtrip_through_proxy() {
    let (addr, token) = spawn_rendezvous().await;

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (a, b) = connect_pair(&addr, 7, |_| {}, move |frame| {
        let _ = frame_tx.send(frame);
    })
    .await;

    let payload = vec![0x41u8; 500];
    a.send_frame(&payload, 1).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("frame timed out")
        .expect("channel closed");
    assert_eq!(received, payload);

    a.disconnect().await;
    b.disconnect().await;
    token.cancel();
}

#[tokio::test]
async fn test_large_multi_message_frame() {
    let (addr, token) = spawn_rendezvous().await;

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (a, b) = connect_pair(&addr, 11, |_| {}, move |frame| {
        let _ = frame_tx.send(frame);
    })
    .await;

    // 76,800 bytes → two messages, 156 data chunks plus parity.
    let payload: Vec<u8> = (0..=255u8).cycle().take(300 * 256).collect();
    a.send_frame(&payload, 1).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), frame_rx.recv())
        .await
        .expect("frame timed out")
        .expect("channel closed");
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);

    let metrics = b.metrics();
    assert!(metrics.incoming_packets >= 156);
    assert_eq!(metrics.invalid_packets, 0);

    a.disconnect().await;
    b.disconnect().await;
    token.cancel();
}

#[tokio::test]
async fn test_stale_frame_is_dropped() {
    let (addr, token) = spawn_rendezvous().await;

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (a, b) = connect_pair(&addr, 13, |_| {}, move |frame| {
        sink.lock().unwrap().push(frame[0]);
    })
    .await;

    // Tracking ids 5, 7, then the stale 6.
    for id in [5u64, 7, 6] {
        a.send_frame(&[id as u8; 100], id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*seen.lock().unwrap(), vec![5, 7]);
    assert_eq!(b.metrics().out_of_order_frames, 1);

    a.disconnect().await;
    b.disconnect().await;
    token.cancel();
}

// ── Watchdog ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_watchdog_disconnects_idle_link() {
    let (addr, token) = spawn_rendezvous().await;

    // The viewer keeps its watchdog; the host disables it so only
    // one side times out.
    let addr_a = addr.clone();
    let a = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_a, 21, quiet_options(), |_| {}).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let addr_b = addr.clone();
    let b = tokio::spawn(async move {
        UdpEndpoint::connect(&addr_b, 21, EndpointOptions::default(), |_| {}).await
    });

    let a = a.await.unwrap().expect("host connect failed");
    let b = b.await.unwrap().expect("viewer connect failed");
    assert!(b.is_connected());

    // No data ever flows; the watchdog should drop the link within
    // two check intervals.
    let mut disconnected = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        if b.state() == LinkState::Disconnected {
            disconnected = true;
            break;
        }
    }
    assert!(disconnected, "watchdog never fired");

    a.disconnect().await;
    b.disconnect().await;
    token.cancel();
}

// ── Back-channel ─────────────────────────────────────────────────

#[derive(Default)]
struct ButtonRecorder {
    buttons: Vec<u8>,
}

impl ResponseListener for ButtonRecorder {
    fn on_button_event(&mut self, _device: u8, _pressed: bool, button_id: u8, _unicode: u32) {
        self.buttons.push(button_id);
    }
}

#[tokio::test]
async fn test_back_channel_dedup_over_transport() {
    let (addr, token) = spawn_rendezvous().await;

    // The host decodes viewer responses as they arrive in frames.
    let recorder = Arc::new(Mutex::new((ResponseDecoder::new(), ButtonRecorder::default())));
    let host_sink = Arc::clone(&recorder);
    let (host, viewer) = connect_pair(&addr, 33, move |frame| {
        let mut guard = host_sink.lock().unwrap();
        let (decoder, listener) = &mut *guard;
        decoder.parse_packet(&frame, listener);
    }, |_| {})
    .await;

    // Twelve button presses overflow one packet; every packet re-sends
    // recent history, yet each event must arrive exactly once.
    let mut encoder = ResponseEncoder::new();
    for i in 0..12u8 {
        encoder.track_button(1, true, i, 0);
    }
    encoder.track_metrics(viewer.metrics());

    let packets = encoder.to_packets();
    assert!(packets.len() >= 2);
    for (i, packet) in packets.iter().enumerate() {
        viewer.send_frame(packet, (i + 1) as u64).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let guard = recorder.lock().unwrap();
    assert_eq!(guard.1.buttons, (0..12u8).collect::<Vec<_>>());

    host.disconnect().await;
    viewer.disconnect().await;
    token.cancel();
}
