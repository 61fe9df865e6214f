//! Program configuration consumed by the transport endpoint and the
//! outer host/viewer harness.
//!
//! Values arrive from the command line (or a config file) already
//! parsed; this module owns defaults, clamping, and the protocol
//! string format `<scheme>://<address>:<port>` where the scheme
//! selects a transport and the remainder is opaque to the core.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

// ── ProtocolString ───────────────────────────────────────────────

/// A `<scheme>://<rest>` transport selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolString {
    /// Transport name, e.g. `UdpProxy`.
    pub scheme: String,
    /// Everything after `://`, opaque to the core (for the UDP
    /// transport: the rendezvous address).
    pub remainder: String,
}

impl ProtocolString {
    /// Split a protocol string on the first `://`. A string without
    /// a separator is all scheme.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once("://") {
            Some((scheme, remainder)) => Self {
                scheme: scheme.to_string(),
                remainder: remainder.to_string(),
            },
            None => Self {
                scheme: raw.to_string(),
                remainder: String::new(),
            },
        }
    }
}

impl std::fmt::Display for ProtocolString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.remainder.is_empty() {
            write!(f, "{}", self.scheme)
        } else {
            write!(f, "{}://{}", self.scheme, self.remainder)
        }
    }
}

/// Parse `host:port`, splitting on the **last** colon.
pub fn parse_socket_addr(address: &str) -> Result<SocketAddr, TransportError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;

    // Bracketed IPv6 literals arrive as `[::1]`.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host
        .parse()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;

    Ok(SocketAddr::new(ip, port))
}

// ── ProgramOptions ───────────────────────────────────────────────

/// Parsed configuration for a host or viewer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramOptions {
    /// Transport selector and rendezvous address.
    pub protocol: ProtocolString,
    /// Session id used to pair with a specific peer.
    pub session_id: u64,
    /// Seconds to wait for a remote peer before giving up.
    pub peer_timeout: u32,
    /// Non-keyframes between two keyframes.
    pub key_frame_distance: u32,
    /// Desired video bitrate in kilobits per second.
    pub target_bitrate_kbps: u32,
    /// Ignore remote input on the host.
    pub disable_input: bool,
    /// Open a console for log output.
    pub show_console: bool,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            protocol: ProtocolString::parse("UdpProxy://127.0.0.1:41988"),
            session_id: 0,
            peer_timeout: 30,
            key_frame_distance: 3,
            target_bitrate_kbps: 10_000,
            disable_input: false,
            show_console: false,
        }
    }
}

impl ProgramOptions {
    /// Apply the documented bounds to every field.
    pub fn clamped(mut self) -> Self {
        self.key_frame_distance = self.key_frame_distance.max(1);
        self.target_bitrate_kbps = self.target_bitrate_kbps.clamp(100, 50_000);
        self
    }

    pub fn input_enabled(&self) -> bool {
        !self.disable_input
    }
}

// ── Tests ────────────────────────────────────────────────────────
