//! Per-track ingestion counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use broadcast_ipc::TrackKind;

#[derive(Default)]
struct TrackCounters {
    appended: AtomicU64,
    bytes: AtomicU64,
    invalid: AtomicU64,
    not_writing: AtomicU64,
    backpressure: AtomicU64,
    before_anchor: AtomicU64,
}

impl TrackCounters {
    fn snapshot(&self, kind: TrackKind) -> TrackMetrics {
        TrackMetrics {
            kind,
            appended: self.appended.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            not_writing: self.not_writing.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            before_anchor: self.before_anchor.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackMetrics {
    pub kind: TrackKind,
    pub appended: u64,
    pub bytes: u64,
    /// Invalid or not-ready buffers.
    pub invalid: u64,
    /// Buffers that arrived outside `Writing`.
    pub not_writing: u64,
    /// Buffers refused because the track input was full.
    pub backpressure: u64,
    /// Buffers timestamped before the session anchor.
    pub before_anchor: u64,
}

impl TrackMetrics {
    /// Total buffers not appended.
    pub fn dropped(&self) -> u64 {
        self.invalid + self.not_writing + self.backpressure + self.before_anchor
    }
}

/// Point-in-time view of a multiplexer's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Time since writing started.
    pub elapsed: Duration,
    pub paused: bool,
    pub tracks: Vec<TrackMetrics>,
}

impl MetricsSnapshot {
    /// Counters of one track.
    pub fn track(&self, kind: TrackKind) -> Option<&TrackMetrics> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Collects ingestion counters for every track.
pub struct MuxMetrics {
    start_time: RwLock<Option<Instant>>,
    paused: AtomicBool,
    tracks: [TrackCounters; 3],
}

impl MuxMetrics {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            paused: AtomicBool::new(false),
            tracks: Default::default(),
        }
    }

    fn counters(&self, kind: TrackKind) -> &TrackCounters {
        match kind {
            TrackKind::Video => &self.tracks[0],
            TrackKind::AppAudio => &self.tracks[1],
            TrackKind::MicAudio => &self.tracks[2],
        }
    }

    pub(crate) fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub(crate) fn record_appended(&self, kind: TrackKind, bytes: usize) {
        let counters = self.counters(kind);
        counters.appended.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid(&self, kind: TrackKind) {
        self.counters(kind).invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_not_writing(&self, kind: TrackKind) {
        self.counters(kind).not_writing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure(&self, kind: TrackKind) {
        self.counters(kind).backpressure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_before_anchor(&self, kind: TrackKind) {
        self.counters(kind).before_anchor.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self
            .start_time
            .read()
            .map(|start| start.elapsed())
            .unwrap_or_default();

        MetricsSnapshot {
            elapsed,
            paused: self.paused.load(Ordering::Relaxed),
            tracks: TrackKind::ALL
                .iter()
                .map(|kind| self.counters(*kind).snapshot(*kind))
                .collect(),
        }
    }

    /// Log one summary line per track that saw any buffer.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        for track in snapshot.tracks.iter().filter(|t| t.appended + t.dropped() > 0) {
            info!(
                track = track.kind.name(),
                appended = track.appended,
                bytes = track.bytes,
                invalid = track.invalid,
                not_writing = track.not_writing,
                backpressure = track.backpressure,
                before_anchor = track.before_anchor,
                "Track summary"
            );
        }
    }
}

impl Default for MuxMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_track() {
        let metrics = MuxMetrics::new();
        metrics.record_appended(TrackKind::Video, 100);
        metrics.record_appended(TrackKind::Video, 50);
        metrics.record_backpressure(TrackKind::MicAudio);
        metrics.record_invalid(TrackKind::MicAudio);

        let snapshot = metrics.snapshot();
        let video = snapshot.track(TrackKind::Video).unwrap();
        assert_eq!(video.appended, 2);
        assert_eq!(video.bytes, 150);
        assert_eq!(video.dropped(), 0);

        let mic = snapshot.track(TrackKind::MicAudio).unwrap();
        assert_eq!(mic.appended, 0);
        assert_eq!(mic.dropped(), 2);

        assert_eq!(snapshot.track(TrackKind::AppAudio).unwrap().dropped(), 0);
    }

    #[test]
    fn test_elapsed_is_zero_before_start() {
        let metrics = MuxMetrics::new();
        assert_eq!(metrics.snapshot().elapsed, Duration::ZERO);
        assert!(!metrics.snapshot().paused);

        metrics.set_paused(true);
        assert!(metrics.snapshot().paused);
    }
}
