//! Stream deframer — recovers frames from the raw stream transport.
//!
//! The stream carries frames back to back with no length prefix. Each frame is
//! bracketed by FRAME_START and FRAME_END, so the deframer keeps a single
//! arena of unclassified bytes and a cursor recording how far the end-marker
//! search has already progressed. Bytes are never rescanned and never moved:
//! complete frames are split off the front of the arena as shared `Bytes`.
//!
//! Invariants held between calls:
//!   - when `in_frame`, the arena begins with FRAME_START and contains no
//!     FRAME_END before `scan`
//!   - when not `in_frame`, the arena holds at most one byte (a trailing 0xFF
//!     that may be the first half of a start marker)
//!   - the arena never exceeds `max_buffer` bytes

use bytes::{Buf, Bytes, BytesMut};

use camrelay_core::wire::{FRAME_END, FRAME_START};

const MARKER_LEN: usize = 2;

/// Running totals, for stats and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeframerCounters {
    pub frames: u64,
    pub bytes_discarded: u64,
    pub resyncs: u64,
}

pub struct StreamDeframer {
    buf: BytesMut,
    in_frame: bool,
    scan: usize,
    max_buffer: usize,
    counters: DeframerCounters,
}

impl StreamDeframer {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_buffer.min(64 * 1024)),
            in_frame: false,
            scan: MARKER_LEN,
            max_buffer: max_buffer.max(MARKER_LEN * 2),
            counters: DeframerCounters::default(),
        }
    }

    /// Append received bytes and return every frame they complete, in order.
    /// Each frame includes both markers.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame && !self.sync_to_start() {
                break;
            }
            match find(&self.buf[self.scan..], &FRAME_END) {
                Some(offset) => {
                    let end = self.scan + offset + MARKER_LEN;
                    let frame = self.buf.split_to(end).freeze();
                    self.in_frame = false;
                    self.scan = MARKER_LEN;
                    // Over the limit even when it arrived in one read: dropped
                    // exactly as a slowly arriving copy would have been.
                    if frame.len() > self.max_buffer {
                        self.counters.resyncs += 1;
                        self.counters.bytes_discarded += frame.len() as u64;
                        tracing::warn!(
                            len = frame.len(),
                            max = self.max_buffer,
                            "stream desync: frame exceeds buffer limit, dropped"
                        );
                        continue;
                    }
                    frames.push(frame);
                    self.counters.frames += 1;
                }
                None => {
                    // A trailing 0xFF may pair with the next chunk's first byte.
                    self.scan = self.buf.len().saturating_sub(1).max(MARKER_LEN);
                    break;
                }
            }
        }

        while self.buf.len() > self.max_buffer {
            self.recover();
        }

        frames
    }

    /// Drop all buffered bytes. Used when the producer connection changes.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_frame = false;
        self.scan = MARKER_LEN;
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// True while a start marker has been seen without its end marker.
    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn counters(&self) -> DeframerCounters {
        self.counters
    }

    /// Discard bytes up to the next start marker. Returns false when there is
    /// none yet, leaving at most a trailing 0xFF buffered.
    fn sync_to_start(&mut self) -> bool {
        match find(&self.buf, &FRAME_START) {
            Some(pos) => {
                self.discard(pos);
                self.in_frame = true;
                self.scan = MARKER_LEN;
                true
            }
            None => {
                let keep = usize::from(self.buf.last() == Some(&FRAME_START[0]));
                self.discard(self.buf.len() - keep);
                false
            }
        }
    }

    /// Desync recovery: the pending frame outgrew the arena. Resume from the
    /// last start marker after the pending one, or start over.
    fn recover(&mut self) {
        self.counters.resyncs += 1;
        let before = self.buf.len();
        match rfind(&self.buf[MARKER_LEN..], &FRAME_START) {
            Some(offset) => {
                self.discard(MARKER_LEN + offset);
                self.in_frame = true;
                // No end marker followed the old start, so none follows this one.
                self.scan = self.buf.len().saturating_sub(1).max(MARKER_LEN);
            }
            None => {
                self.in_frame = false;
                self.scan = MARKER_LEN;
                let keep = usize::from(self.buf.last() == Some(&FRAME_START[0]));
                self.discard(self.buf.len() - keep);
            }
        }
        tracing::warn!(
            buffered = before,
            kept = self.buf.len(),
            max = self.max_buffer,
            "stream desync: no frame boundary within buffer limit, resynchronizing"
        );
    }

    fn discard(&mut self, n: usize) {
        if n > 0 {
            self.buf.advance(n);
            self.counters.bytes_discarded += n as u64;
        }
    }
}

fn find(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(MARKER_LEN).position(|w| w == marker)
}

fn rfind(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(MARKER_LEN).rposition(|w| w == marker)
}
