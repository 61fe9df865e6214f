//! End-to-end profiling: the metric vocabulary and the per-frame
//! timing probe carried from capture to presentation.
//!
//! A [`PerfProbe`] is created when a frame enters the pipeline and
//! travels with the frame's tracking id. Stages record stacked or
//! absolute times into it; the viewer projects the recorded values
//! into back-channel packets, and the host rebuilds the probe on the
//! other side to close the loop (network round-trip included).

use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::TransportError;

// ── PerfMetric ───────────────────────────────────────────────────

/// Every metric the pipeline can record. Timing metrics hold
/// seconds; the rest are plain counter samples.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PerfMetric {
    RequestedDatarate = 1,
    EncodedDatarate = 2,
    CaptureFps = 3,
    ViewerFps = 4,
    HostLostFrames = 5,

    ViewerLostPackets = 6,
    ViewerLostFrames = 7,
    ViewerOutOfOrderFrames = 8,
    ViewerIncomingPackets = 9,
    ViewerValidPackets = 10,
    ViewerInvalidPackets = 11,
    ViewerDuplicatePackets = 12,
    ViewerUnableToDecodeFrame = 13,
    ViewerInsufficientFrameData = 14,

    CaptureFrameDelta = 16,
    ViewerFrameDelta = 17,
    CpuUsage = 18,
    GopLength = 19,

    TimeReconfigureEncoder = 20,
    TimeReconfigureCapture = 21,
    TimeScreenCapture = 22,
    TimeImportToEncoder = 23,
    TimeEncoderPreprocessing = 24,
    TimeEncoding = 25,
    TimeNetworkRoundtrip = 26,
    TimeReconfigureDecoder = 27,
    TimeDecoding = 28,
    TimeExportFromDecoder = 29,
    TimeRendering = 30,
    TimePresented = 31,
}

impl PerfMetric {
    /// All metrics in wire-id order, for projection into back-channel
    /// packets.
    pub const ALL: [PerfMetric; 30] = [
        PerfMetric::RequestedDatarate,
        PerfMetric::EncodedDatarate,
        PerfMetric::CaptureFps,
        PerfMetric::ViewerFps,
        PerfMetric::HostLostFrames,
        PerfMetric::ViewerLostPackets,
        PerfMetric::ViewerLostFrames,
        PerfMetric::ViewerOutOfOrderFrames,
        PerfMetric::ViewerIncomingPackets,
        PerfMetric::ViewerValidPackets,
        PerfMetric::ViewerInvalidPackets,
        PerfMetric::ViewerDuplicatePackets,
        PerfMetric::ViewerUnableToDecodeFrame,
        PerfMetric::ViewerInsufficientFrameData,
        PerfMetric::CaptureFrameDelta,
        PerfMetric::ViewerFrameDelta,
        PerfMetric::CpuUsage,
        PerfMetric::GopLength,
        PerfMetric::TimeReconfigureEncoder,
        PerfMetric::TimeReconfigureCapture,
        PerfMetric::TimeScreenCapture,
        PerfMetric::TimeImportToEncoder,
        PerfMetric::TimeEncoderPreprocessing,
        PerfMetric::TimeEncoding,
        PerfMetric::TimeNetworkRoundtrip,
        PerfMetric::TimeReconfigureDecoder,
        PerfMetric::TimeDecoding,
        PerfMetric::TimeExportFromDecoder,
        PerfMetric::TimeRendering,
        PerfMetric::TimePresented,
    ];

}

impl TryFrom<u8> for PerfMetric {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, TransportError> {
        PerfMetric::ALL
            .iter()
            .copied()
            .find(|m| *m as u8 == value)
            .ok_or(TransportError::UnknownVariant {
                type_name: "PerfMetric",
                value: value as u64,
            })
    }
}

// ── PerfProbe ────────────────────────────────────────────────────

/// Timing probe for one frame, keyed by the frame's tracking id.
#[derive(Debug, Clone)]
pub struct PerfProbe {
    tracking_id: i64,
    created: Instant,
    last_mark: Instant,
    values: BTreeMap<PerfMetric, f64>,
}

impl PerfProbe {
    pub fn new(tracking_id: i64) -> Self {
        let now = Instant::now();
        Self {
            tracking_id,
            created: now,
            last_mark: now,
            values: BTreeMap::new(),
        }
    }

    pub fn tracking_id(&self) -> i64 {
        self.tracking_id
    }

    /// Seconds since the probe was created.
    pub fn total_elapsed_time(&self) -> f64 {
        self.created.elapsed().as_secs_f64()
    }

    /// Record the time since the previous stacked record (or probe
    /// creation), then restart the stopwatch. Measures one pipeline
    /// stage.
    pub fn record_stacked_time(&mut self, metric: PerfMetric) {
        let now = Instant::now();
        self.record_raw(metric, (now - self.last_mark).as_secs_f64());
        self.last_mark = now;
    }

    /// Record the time since probe creation without touching the
    /// stopwatch.
    pub fn record_absolute_time(&mut self, metric: PerfMetric) {
        self.record_raw(metric, self.created.elapsed().as_secs_f64());
    }

    /// Record a counter sample. The latest sample wins.
    pub fn record_counter(&mut self, metric: PerfMetric, value: f64) {
        self.record_raw(metric, value);
    }

    /// Set a metric value directly.
    pub fn record_raw(&mut self, metric: PerfMetric, value: f64) {
        self.values.insert(metric, value);
    }

    pub fn has_record(&self, metric: PerfMetric) -> bool {
        self.values.contains_key(&metric)
    }

    pub fn query(&self, metric: PerfMetric) -> f64 {
        self.values.get(&metric).copied().unwrap_or(0.0)
    }

    /// Number of recorded metrics (the probe's back-channel budget
    /// footprint).
    pub fn record_count(&self) -> usize {
        self.values.len()
    }

    /// Recorded metrics in wire-id order.
    pub fn records(&self) -> impl Iterator<Item = (PerfMetric, f64)> + '_ {
        self.values.iter().map(|(m, v)| (*m, *v))
    }
}

// ── Tests ────────────────────────────────────────────────────────
