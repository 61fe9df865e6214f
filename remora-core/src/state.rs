//! Link state shared between the endpoint owner, the receive task and
//! the liveness watchdog.
//!
//! ```text
//!  Disconnected ──► WaitingForProxy ──► WaitingForPeer ──► Connected
//!       ▲                  │                   │               │
//!       └──────────────────┴───────────────────┴───────────────┘
//!                (disconnect / liveness timeout)
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

// ── LinkState ────────────────────────────────────────────────────

/// The current phase of a session-paired UDP link.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No active link. Initial / terminal state.
    #[default]
    Disconnected = 0,
    /// Pings are flowing; the rendezvous proxy has not answered yet.
    WaitingForProxy = 1,
    /// The proxy answered with our public endpoint; the peer has not
    /// checked in under the same session id yet.
    WaitingForPeer = 2,
    /// Both peers checked in; data may flow.
    Connected = 3,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }

    pub fn is_disconnected(self) -> bool {
        self == LinkState::Disconnected
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::WaitingForProxy,
            2 => LinkState::WaitingForPeer,
            3 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::WaitingForProxy => write!(f, "WaitingForProxy"),
            Self::WaitingForPeer => write!(f, "WaitingForPeer"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

// ── LinkStateCell ────────────────────────────────────────────────

/// Atomic holder for a [`LinkState`], shared across tasks.
#[derive(Debug, Default)]
pub struct LinkStateCell(AtomicU8);

impl LinkStateCell {
    pub fn new(state: LinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Store `next` only while in `expected`; returns whether the
    /// transition happened.
    pub fn transition(&self, expected: LinkState, next: LinkState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert!(LinkState::default().is_disconnected());
        assert!(LinkStateCell::default().load().is_disconnected());
    }

    #[test]
    fn cell_roundtrip() {
        let cell = LinkStateCell::new(LinkState::WaitingForProxy);
        assert_eq!(cell.load(), LinkState::WaitingForProxy);

        cell.store(LinkState::Connected);
        assert!(cell.load().is_connected());
    }

    #[test]
    fn transition_guards_expected_state() {
        let cell = LinkStateCell::new(LinkState::WaitingForProxy);

        assert!(cell.transition(LinkState::WaitingForProxy, LinkState::WaitingForPeer));
        assert_eq!(cell.load(), LinkState::WaitingForPeer);

        // Stale transition does not fire.
        assert!(!cell.transition(LinkState::WaitingForProxy, LinkState::Connected));
        assert_eq!(cell.load(), LinkState::WaitingForPeer);
    }

    #[test]
    fn display_format() {
        assert_eq!(LinkState::Disconnected.to_string(), "Disconnected");
        assert_eq!(LinkState::WaitingForProxy.to_string(), "WaitingForProxy");
        assert_eq!(LinkState::WaitingForPeer.to_string(), "WaitingForPeer");
        assert_eq!(LinkState::Connected.to_string(), "Connected");
    }
}
