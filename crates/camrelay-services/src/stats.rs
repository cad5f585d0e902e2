//! Statistics — frame-rate windows, producer link counters, relay totals.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

const FPS_WINDOW: usize = 10;

/// Average frame rate over the last few frames.
#[derive(Debug, Clone, Default)]
pub struct FpsWindow {
    stamps: VecDeque<Instant>,
}

impl FpsWindow {
    pub fn record(&mut self, now: Instant) {
        if self.stamps.len() == FPS_WINDOW {
            self.stamps.pop_front();
        }
        self.stamps.push_back(now);
    }

    /// Frames per second across the window. 0 until two frames are seen.
    pub fn fps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if self.stamps.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / span
    }
}

// ── Producer link ─────────────────────────────────────────────────────────────

/// Producer-side counters. Everything except `connects` is per session and
/// cleared each time the link comes up.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub capture_failures: u64,
    pub send_failures: u64,
    pub skipped: u64,
    pub connects: u64,
    pub fps: FpsWindow,
}

impl LinkStats {
    pub fn on_connected(&mut self) {
        *self = LinkStats {
            connects: self.connects + 1,
            ..LinkStats::default()
        };
    }

    pub fn on_sent(&mut self, bytes: usize, now: Instant) {
        self.frames_sent += 1;
        self.bytes_sent += bytes as u64;
        self.fps.record(now);
    }
}

// ── Relay ─────────────────────────────────────────────────────────────────────

/// Relay totals, shared by every ingest and viewer task.
pub type RelayStatsHandle = Arc<RelayStats>;

#[derive(Debug, Default)]
pub struct RelayStats {
    pub frames_published: AtomicU64,
    pub bytes_published: AtomicU64,
    pub stream_frames: AtomicU64,
    pub datagram_frames: AtomicU64,
    pub stream_resyncs: AtomicU64,
    pub stream_bytes_discarded: AtomicU64,
    pub producer_sessions: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub datagrams_dropped: AtomicU64,
    pub handshakes: AtomicU64,
    pub expired_sets: AtomicU64,
    pub evicted_sets: AtomicU64,
    pub viewers_attached: AtomicU64,
    pub viewers_refused: AtomicU64,
    fps: Mutex<FpsWindow>,
    datagram_producer: Mutex<Option<SocketAddr>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub frames_published: u64,
    pub bytes_published: u64,
    pub fps: f64,
    pub stream_frames: u64,
    pub datagram_frames: u64,
    pub stream_resyncs: u64,
    pub stream_bytes_discarded: u64,
    pub producer_sessions: u64,
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub handshakes: u64,
    pub expired_sets: u64,
    pub evicted_sets: u64,
    pub viewers_attached: u64,
    pub viewers_refused: u64,
    pub datagram_producer: Option<String>,
}

impl RelayStats {
    pub fn shared() -> RelayStatsHandle {
        Arc::new(Self::default())
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one frame handed to the multiplexer.
    pub fn record_frame(&self, len: usize, now: Instant) {
        Self::inc(&self.frames_published);
        Self::add(&self.bytes_published, len as u64);
        self.fps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(now);
    }

    pub fn set_datagram_producer(&self, peer: Option<SocketAddr>) {
        *self
            .datagram_producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = peer;
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RelayStatsSnapshot {
            frames_published: get(&self.frames_published),
            bytes_published: get(&self.bytes_published),
            fps: self
                .fps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fps(),
            stream_frames: get(&self.stream_frames),
            datagram_frames: get(&self.datagram_frames),
            stream_resyncs: get(&self.stream_resyncs),
            stream_bytes_discarded: get(&self.stream_bytes_discarded),
            producer_sessions: get(&self.producer_sessions),
            datagrams_received: get(&self.datagrams_received),
            datagrams_dropped: get(&self.datagrams_dropped),
            handshakes: get(&self.handshakes),
            expired_sets: get(&self.expired_sets),
            evicted_sets: get(&self.evicted_sets),
            viewers_attached: get(&self.viewers_attached),
            viewers_refused: get(&self.viewers_refused),
            datagram_producer: self
                .datagram_producer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|p| p.to_string()),
        }
    }

    /// One structured log line with the totals.
    pub fn log_summary(&self, viewers: usize) {
        let s = self.snapshot();
        tracing::info!(
            frames = s.frames_published,
            bytes = s.bytes_published,
            fps = %format!("{:.1}", s.fps),
            viewers,
            resyncs = s.stream_resyncs,
            dropped_datagrams = s.datagrams_dropped,
            expired = s.expired_sets,
            "relay stats"
        );
    }
}
