//! Viewer→host back-channel codec.
//!
//! The viewer streams input and telemetry upstream in a fixed-layout
//! packet that fits a single data chunk payload. Because the channel
//! is plain UDP, every packet re-sends a sliding history of recent
//! events; the decoder suppresses duplicates through monotonic input
//! identifiers, so each event is delivered exactly once under loss
//! and redundancy alike.
//!
//! ```text
//! Offset  Size   Field
//! ──────  ─────  ──────────────
//!   0       8    magic
//!   8       4    client_id
//!  12      16    mouse x, y, dx, dy         (f32 × 4)
//!  28      64    ConnectionMetrics
//!  92       1    axis_count
//!  93     112    axis events      14 × (input_id u16, device u8,
//!                                       axis u8, value f32)
//! 205       1    button_count
//! 206      90    button events    10 × (input_id u16, device u8,
//!                                       pressed u8, button u8,
//!                                       unicode u32)
//! 296       1    profiling_count
//! 297      45    profiling        5 × (tracking_id i64, end u8)
//! 342     135    metric entries   27 × (metric_id u8, value f32)
//! ──────  ─────  ──────────────
//! Total:  477 bytes (zero-padded to the 494-byte chunk payload)
//! ```

use std::collections::{HashSet, VecDeque};

use bytes::{Buf, BufMut};

use crate::chunk::CHUNK_PAYLOAD_SIZE;
use crate::error::TransportError;
use crate::metrics::ConnectionMetrics;
use crate::perf::{PerfMetric, PerfProbe};

/// Identifies a back-channel packet.
pub const RESPONSE_MAGIC: u64 = 0x52e6_a4d1_9b38_07c5;

pub const MAX_AXIS_EVENTS: usize = 14;
pub const MAX_BUTTON_EVENTS: usize = 10;
pub const MAX_PROFILING_RECORDS: usize = 5;
pub const MAX_METRIC_ENTRIES: usize = 27;

/// Used bytes of the packet layout.
pub const RESPONSE_PACKET_SIZE: usize = 477;

const _: () = assert!(RESPONSE_PACKET_SIZE <= CHUNK_PAYLOAD_SIZE);

// ── Events ───────────────────────────────────────────────────────

/// One analog axis sample (stick, trigger, wheel).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisEvent {
    pub input_id: u16,
    pub device_id: u8,
    pub axis_id: u8,
    pub value: f32,
}

/// One button or key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub input_id: u16,
    pub device_id: u8,
    pub is_pressed: bool,
    pub button_id: u8,
    pub unicode_char: u32,
}

#[derive(Debug, Clone, Copy)]
struct ProfilingRecord {
    tracking_id: i64,
    /// Exclusive end of this record's slice of the metric entries.
    metric_end: u8,
}

#[derive(Debug, Clone, Copy)]
struct MetricEntry {
    metric_id: u8,
    value: f32,
}

// ── ResponseListener ─────────────────────────────────────────────

/// Receives decoded back-channel events on the host side.
pub trait ResponseListener {
    fn on_mouse_absolute(&mut self, _x: f32, _y: f32) {}
    fn on_mouse_relative(&mut self, _dx: f32, _dy: f32) {}
    fn on_axis_event(&mut self, _device_id: u8, _axis_id: u8, _value: f32) {}
    fn on_button_event(&mut self, _device_id: u8, _is_pressed: bool, _button_id: u8, _unicode: u32) {
    }
    fn on_profiling_event(&mut self, _probe: PerfProbe) {}
}

// ── Wire packet ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct ResponsePacket {
    client_id: i32,
    mouse_x: f32,
    mouse_y: f32,
    mouse_dx: f32,
    mouse_dy: f32,
    metrics: ConnectionMetrics,
    axes: Vec<AxisEvent>,
    buttons: Vec<ButtonEvent>,
    profiling: Vec<ProfilingRecord>,
    metric_entries: Vec<MetricEntry>,
}

impl ResponsePacket {
    fn encode(&self) -> [u8; CHUNK_PAYLOAD_SIZE] {
        let mut out = [0u8; CHUNK_PAYLOAD_SIZE];
        let mut buf = &mut out[..];

        buf.put_u64_le(RESPONSE_MAGIC);
        buf.put_i32_le(self.client_id);
        buf.put_f32_le(self.mouse_x);
        buf.put_f32_le(self.mouse_y);
        buf.put_f32_le(self.mouse_dx);
        buf.put_f32_le(self.mouse_dy);
        self.metrics.encode_into(&mut buf);

        buf.put_u8(self.axes.len() as u8);
        for i in 0..MAX_AXIS_EVENTS {
            let axis = self.axes.get(i).copied().unwrap_or(AxisEvent {
                input_id: 0,
                device_id: 0,
                axis_id: 0,
                value: 0.0,
            });
            buf.put_u16_le(axis.input_id);
            buf.put_u8(axis.device_id);
            buf.put_u8(axis.axis_id);
            buf.put_f32_le(axis.value);
        }

        buf.put_u8(self.buttons.len() as u8);
        for i in 0..MAX_BUTTON_EVENTS {
            let button = self.buttons.get(i).copied().unwrap_or(ButtonEvent {
                input_id: 0,
                device_id: 0,
                is_pressed: false,
                button_id: 0,
                unicode_char: 0,
            });
            buf.put_u16_le(button.input_id);
            buf.put_u8(button.device_id);
            buf.put_u8(button.is_pressed as u8);
            buf.put_u8(button.button_id);
            buf.put_u32_le(button.unicode_char);
        }

        buf.put_u8(self.profiling.len() as u8);
        for i in 0..MAX_PROFILING_RECORDS {
            let record = self.profiling.get(i).copied().unwrap_or(ProfilingRecord {
                tracking_id: 0,
                metric_end: 0,
            });
            buf.put_i64_le(record.tracking_id);
            buf.put_u8(record.metric_end);
        }

        for i in 0..MAX_METRIC_ENTRIES {
            let entry = self.metric_entries.get(i).copied().unwrap_or(MetricEntry {
                metric_id: 0,
                value: 0.0,
            });
            buf.put_u8(entry.metric_id);
            buf.put_f32_le(entry.value);
        }

        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < RESPONSE_PACKET_SIZE {
            return Err(TransportError::InvalidChunkLength {
                expected: RESPONSE_PACKET_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let magic = buf.get_u64_le();
        if magic != RESPONSE_MAGIC {
            return Err(TransportError::UnknownVariant {
                type_name: "ResponsePacket",
                value: magic,
            });
        }

        let client_id = buf.get_i32_le();
        let mouse_x = buf.get_f32_le();
        let mouse_y = buf.get_f32_le();
        let mouse_dx = buf.get_f32_le();
        let mouse_dy = buf.get_f32_le();
        let metrics = ConnectionMetrics::decode(&buf[..ConnectionMetrics::WIRE_SIZE])?;
        buf.advance(ConnectionMetrics::WIRE_SIZE);

        let axis_count = (buf.get_u8() as usize).min(MAX_AXIS_EVENTS);
        let mut axes = Vec::with_capacity(axis_count);
        for i in 0..MAX_AXIS_EVENTS {
            let event = AxisEvent {
                input_id: buf.get_u16_le(),
                device_id: buf.get_u8(),
                axis_id: buf.get_u8(),
                value: buf.get_f32_le(),
            };
            if i < axis_count {
                axes.push(event);
            }
        }

        let button_count = (buf.get_u8() as usize).min(MAX_BUTTON_EVENTS);
        let mut buttons = Vec::with_capacity(button_count);
        for i in 0..MAX_BUTTON_EVENTS {
            let event = ButtonEvent {
                input_id: buf.get_u16_le(),
                device_id: buf.get_u8(),
                is_pressed: buf.get_u8() != 0,
                button_id: buf.get_u8(),
                unicode_char: buf.get_u32_le(),
            };
            if i < button_count {
                buttons.push(event);
            }
        }

        let profiling_count = (buf.get_u8() as usize).min(MAX_PROFILING_RECORDS);
        let mut profiling = Vec::with_capacity(profiling_count);
        for i in 0..MAX_PROFILING_RECORDS {
            let record = ProfilingRecord {
                tracking_id: buf.get_i64_le(),
                metric_end: buf.get_u8(),
            };
            if i < profiling_count {
                profiling.push(record);
            }
        }

        let mut metric_entries = Vec::with_capacity(MAX_METRIC_ENTRIES);
        for _ in 0..MAX_METRIC_ENTRIES {
            metric_entries.push(MetricEntry {
                metric_id: buf.get_u8(),
                value: buf.get_f32_le(),
            });
        }

        Ok(Self {
            client_id,
            mouse_x,
            mouse_y,
            mouse_dx,
            mouse_dy,
            metrics,
            axes,
            buttons,
            profiling,
            metric_entries,
        })
    }
}

// ── ResponseEncoder ──────────────────────────────────────────────

/// Builds back-channel packets on the viewer side.
///
/// Events are tracked into sliding history windows sized to the
/// packet capacities; every generated packet carries the full current
/// history so recent events survive datagram loss.
#[derive(Debug)]
pub struct ResponseEncoder {
    client_id: i32,
    input_counter: u16,

    mouse_x: f32,
    mouse_y: f32,
    mouse_dx: f32,
    mouse_dy: f32,
    metrics: ConnectionMetrics,

    axis_history: VecDeque<AxisEvent>,
    button_history: VecDeque<ButtonEvent>,
    profiling_history: VecDeque<PerfProbe>,

    /// Events tracked since the last generated packet.
    pending_axes: usize,
    pending_buttons: usize,
    pending_profiling: usize,
    /// Metric entries the pending profiling records would occupy.
    pending_metric_entries: usize,

    packet_queue: Vec<ResponsePacket>,
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self {
            client_id: rand::random(),
            input_counter: rand::random(),
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_dx: 0.0,
            mouse_dy: 0.0,
            metrics: ConnectionMetrics::default(),
            axis_history: VecDeque::new(),
            button_history: VecDeque::new(),
            profiling_history: VecDeque::new(),
            pending_axes: 0,
            pending_buttons: 0,
            pending_profiling: 0,
            pending_metric_entries: 0,
            packet_queue: Vec::new(),
        }
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// Absolute mouse position in normalized screen coordinates.
    pub fn track_mouse_absolute(&mut self, x: f32, y: f32) {
        self.mouse_x = x;
        self.mouse_y = y;
    }

    /// Relative mouse motion; accumulates until the next packet.
    pub fn track_mouse_relative(&mut self, dx: f32, dy: f32) {
        self.mouse_dx += dx;
        self.mouse_dy += dy;
    }

    pub fn track_button(&mut self, device_id: u8, is_pressed: bool, button_id: u8, unicode: u32) {
        let event = ButtonEvent {
            input_id: self.next_input_id(),
            device_id,
            is_pressed,
            button_id,
            unicode_char: unicode,
        };

        self.button_history.push_back(event);
        while self.button_history.len() > MAX_BUTTON_EVENTS {
            self.button_history.pop_front();
        }

        self.pending_buttons += 1;
        if self.pending_buttons >= MAX_BUTTON_EVENTS {
            self.generate_packet();
        }
    }

    pub fn track_axis(&mut self, device_id: u8, axis_id: u8, value: f32) {
        let event = AxisEvent {
            input_id: self.next_input_id(),
            device_id,
            axis_id,
            value,
        };

        self.axis_history.push_back(event);
        while self.axis_history.len() > MAX_AXIS_EVENTS {
            self.axis_history.pop_front();
        }

        self.pending_axes += 1;
        if self.pending_axes >= MAX_AXIS_EVENTS {
            self.generate_packet();
        }
    }

    /// Track a frame's timing probe for upstream delivery.
    pub fn track_profiling(&mut self, probe: PerfProbe) {
        // Flush first if this probe's metrics would overflow the
        // shared entry budget.
        let record_count = probe.record_count();
        if self.pending_metric_entries + record_count > MAX_METRIC_ENTRIES {
            self.generate_packet();
        }
        self.pending_metric_entries += record_count;

        self.profiling_history.push_back(probe);
        while self.profiling_history.len() > MAX_PROFILING_RECORDS {
            self.profiling_history.pop_front();
        }

        self.pending_profiling += 1;
        if self.pending_profiling >= MAX_PROFILING_RECORDS {
            self.generate_packet();
        }
    }

    /// Latest connection metrics snapshot to embed in each packet.
    pub fn track_metrics(&mut self, metrics: ConnectionMetrics) {
        self.metrics = metrics;
    }

    /// Drain the pending state into ready-to-send chunk payloads.
    ///
    /// The most recent packet stays queued so it is re-sent with the
    /// next call — cheap redundancy on a lossy channel.
    pub fn to_packets(&mut self) -> Vec<[u8; CHUNK_PAYLOAD_SIZE]> {
        self.generate_packet();

        let out = self.packet_queue.iter().map(ResponsePacket::encode).collect();

        if self.packet_queue.len() > 1 {
            let keep = self.packet_queue.split_off(self.packet_queue.len() - 1);
            self.packet_queue = keep;
        }

        out
    }

    fn next_input_id(&mut self) -> u16 {
        let id = self.input_counter;
        self.input_counter = self.input_counter.wrapping_add(1);
        id
    }

    fn generate_packet(&mut self) {
        let mut packet = ResponsePacket {
            client_id: self.client_id,
            mouse_x: self.mouse_x,
            mouse_y: self.mouse_y,
            mouse_dx: self.mouse_dx,
            mouse_dy: self.mouse_dy,
            metrics: self.metrics,
            ..ResponsePacket::default()
        };

        self.mouse_dx = 0.0;
        self.mouse_dy = 0.0;
        self.pending_axes = 0;
        self.pending_buttons = 0;
        self.pending_profiling = 0;
        self.pending_metric_entries = 0;

        packet.axes.extend(self.axis_history.iter().copied());
        packet.buttons.extend(self.button_history.iter().copied());

        // Newest probes first; a probe that no longer fits the metric
        // budget ends the projection.
        for probe in self.profiling_history.iter().rev() {
            if packet.profiling.len() >= MAX_PROFILING_RECORDS {
                break;
            }
            if packet.metric_entries.len() + probe.record_count() > MAX_METRIC_ENTRIES {
                break;
            }
            for (metric, value) in probe.records() {
                packet.metric_entries.push(MetricEntry {
                    metric_id: metric as u8,
                    value: value as f32,
                });
            }
            packet.profiling.push(ProfilingRecord {
                tracking_id: probe.tracking_id(),
                metric_end: packet.metric_entries.len() as u8,
            });
        }

        self.packet_queue.push(packet);
    }
}

// ── ResponseDecoder ──────────────────────────────────────────────

/// Parses back-channel packets on the host side, suppressing the
/// duplicates the redundant encoding produces.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    client_id: i32,
    metrics: ConnectionMetrics,
    seen_axes: HashSet<u16>,
    seen_buttons: HashSet<u16>,
    seen_profiling: HashSet<i64>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client id of the peer whose packet was last parsed.
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// Metrics snapshot from the last parsed packet.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.metrics
    }

    /// Parse one packet payload and deliver fresh events in order.
    ///
    /// Payloads that do not carry the magic are rejected silently —
    /// under transport loss the same event id arriving in several
    /// packets is delivered exactly once.
    pub fn parse_packet(&mut self, payload: &[u8], listener: &mut dyn ResponseListener) {
        let Ok(packet) = ResponsePacket::decode(payload) else {
            return;
        };

        self.client_id = packet.client_id;
        self.metrics = packet.metrics;

        listener.on_mouse_absolute(packet.mouse_x, packet.mouse_y);
        listener.on_mouse_relative(packet.mouse_dx, packet.mouse_dy);

        for axis in &packet.axes {
            if self.seen_axes.insert(axis.input_id) {
                listener.on_axis_event(axis.device_id, axis.axis_id, axis.value);
            }
        }

        for button in &packet.buttons {
            if self.seen_buttons.insert(button.input_id) {
                listener.on_button_event(
                    button.device_id,
                    button.is_pressed,
                    button.button_id,
                    button.unicode_char,
                );
            }
        }

        // Profiling records slice the shared metric-entry pool with
        // exclusive end indices; ranges stay aligned even across
        // duplicate records.
        let mut delivered = Vec::new();
        let mut metric_start = 0usize;
        for record in &packet.profiling {
            let metric_end = (record.metric_end as usize).min(MAX_METRIC_ENTRIES);
            let range = metric_start..metric_end.max(metric_start);
            metric_start = metric_end.max(metric_start);

            if !self.seen_profiling.insert(record.tracking_id) {
                continue;
            }

            let mut probe = PerfProbe::new(record.tracking_id);
            for entry in &packet.metric_entries[range] {
                if let Ok(metric) = PerfMetric::try_from(entry.metric_id) {
                    probe.record_raw(metric, entry.value as f64);
                }
            }
            delivered.push(probe);
        }

        // Newest-first projection means LIFO delivery restores
        // oldest-first order.
        while let Some(probe) = delivered.pop() {
            listener.on_profiling_event(probe);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
