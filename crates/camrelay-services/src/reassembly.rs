//! Fragment reassembly for the datagram transport.
//!
//! Fragments are grouped per sequence number into a FragmentSet. A set
//! completes when every index has arrived and the payload bytes add up to the
//! declared length. There is no retransmission: a set missing a fragment is
//! dropped once it has made no progress for `ttl`, or as soon as a newer frame
//! completes. Recency beats completeness.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use camrelay_core::wire::{self, FragmentHeader, FRAME_START};
use camrelay_core::Frame;

#[derive(Debug, Clone)]
pub struct ReassemblyLimits {
    /// Largest declared frame length accepted.
    pub max_frame_len: usize,
    /// A set with no new fragment for this long is dropped.
    pub ttl: Duration,
    /// Sets in flight at once; also the staleness window.
    pub max_pending: usize,
    /// Completed frames must begin with FRAME_START.
    pub require_start_marker: bool,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_frame_len: wire::DEFAULT_MAX_FRAME_LEN,
            ttl: Duration::from_millis(wire::DEFAULT_FRAGMENT_TTL_MS),
            max_pending: wire::DEFAULT_MAX_PENDING_FRAMES,
            require_start_marker: true,
        }
    }
}

/// Result of accepting one fragment.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Stored; the frame is still incomplete.
    Pending,
    /// This fragment completed the frame.
    Complete(Frame),
    /// An index that had already arrived. Overwrites the earlier copy.
    Duplicate,
    /// Older than what the session has already moved past. Ignored.
    Stale,
    /// The frame's fragments are inconsistent. Its set has been discarded.
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("declared length {0} exceeds the frame limit")]
    FrameTooLarge(u32),
    #[error("fragment index out of range")]
    IndexOutOfRange,
    #[error("declared length is smaller than the fragment count")]
    LengthBelowCount,
    #[error("fragment header disagrees with earlier fragments of the frame")]
    HeaderMismatch,
    #[error("received bytes exceed the declared length")]
    Overflow,
    #[error("all fragments arrived but their length does not match")]
    LengthMismatch,
    #[error("reassembled frame does not begin with a start marker")]
    MissingStartMarker,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyCounters {
    pub completed: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub rejected: u64,
    pub expired: u64,
    pub evicted: u64,
}

struct FragmentSet {
    count: u16,
    total_len: u32,
    fragments: Vec<Option<Bytes>>,
    received_count: u16,
    received_bytes: usize,
    last_progress: Instant,
}

impl FragmentSet {
    fn new(header: &FragmentHeader, now: Instant) -> Self {
        Self {
            count: header.count(),
            total_len: header.total_len(),
            fragments: vec![None; header.count() as usize],
            received_count: 0,
            received_bytes: 0,
            last_progress: now,
        }
    }

    fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.total_len as usize);
        for fragment in self.fragments.into_iter().flatten() {
            buf.extend_from_slice(&fragment);
        }
        buf.freeze()
    }
}

pub struct Reassembler {
    limits: ReassemblyLimits,
    pending: BTreeMap<u32, FragmentSet>,
    last_completed: Option<u32>,
    highest_seen: Option<u32>,
    counters: ReassemblyCounters,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        let limits = ReassemblyLimits {
            max_pending: limits.max_pending.max(1),
            ..limits
        };
        Self {
            limits,
            pending: BTreeMap::new(),
            last_completed: None,
            highest_seen: None,
            counters: ReassemblyCounters::default(),
        }
    }

    /// Accept one fragment. `payload` is copied only if it is stored.
    pub fn accept(&mut self, header: &FragmentHeader, payload: &[u8], now: Instant) -> Outcome {
        let seq = header.seq();

        if self.is_stale(seq) {
            self.counters.stale += 1;
            return Outcome::Stale;
        }

        if let Err(reason) = self.check_header(header) {
            return self.reject(seq, reason);
        }

        if self.highest_seen.map_or(true, |h| seq > h) {
            self.highest_seen = Some(seq);
            self.prune_behind_window();
        }

        if let Some(set) = self.pending.get(&seq) {
            if set.count != header.count() || set.total_len != header.total_len() {
                return self.reject(seq, RejectReason::HeaderMismatch);
            }
        } else {
            self.make_room();
            self.pending.insert(seq, FragmentSet::new(header, now));
        }

        let Some(set) = self.pending.get_mut(&seq) else {
            return Outcome::Pending;
        };
        let slot = &mut set.fragments[header.index() as usize];
        let duplicate = match slot.replace(Bytes::copy_from_slice(payload)) {
            Some(previous) => {
                set.received_bytes -= previous.len();
                true
            }
            None => {
                set.received_count += 1;
                set.last_progress = now;
                false
            }
        };
        set.received_bytes += payload.len();

        if set.received_bytes > set.total_len as usize {
            return self.reject(seq, RejectReason::Overflow);
        }
        if duplicate {
            self.counters.duplicates += 1;
            return Outcome::Duplicate;
        }
        if set.received_count < set.count {
            return Outcome::Pending;
        }
        if set.received_bytes != set.total_len as usize {
            return self.reject(seq, RejectReason::LengthMismatch);
        }

        let Some(set) = self.pending.remove(&seq) else {
            return Outcome::Pending;
        };
        let payload = set.assemble();
        if self.limits.require_start_marker && !payload.starts_with(&FRAME_START) {
            return self.reject(seq, RejectReason::MissingStartMarker);
        }

        self.complete(seq);
        Outcome::Complete(Frame::new(seq, payload))
    }

    /// Drop sets that have made no progress within the TTL. Returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let ttl = self.limits.ttl;
        let before = self.pending.len();
        self.pending.retain(|seq, set| {
            let idle = now.saturating_duration_since(set.last_progress);
            let keep = idle < ttl;
            if !keep {
                tracing::debug!(
                    seq,
                    received = set.received_count,
                    count = set.count,
                    "incomplete frame expired"
                );
            }
            keep
        });
        let expired = before - self.pending.len();
        self.counters.expired += expired as u64;
        expired
    }

    /// Forget all sequence state. Called on handshake.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_completed = None;
        self.highest_seen = None;
    }

    /// Sets currently being reassembled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn last_completed(&self) -> Option<u32> {
        self.last_completed
    }

    pub fn counters(&self) -> ReassemblyCounters {
        self.counters
    }

    fn is_stale(&self, seq: u32) -> bool {
        if self.last_completed.is_some_and(|done| seq <= done) {
            return true;
        }
        self.highest_seen
            .is_some_and(|h| seq < h && (h - seq) as usize >= self.limits.max_pending)
    }

    fn check_header(&self, header: &FragmentHeader) -> Result<(), RejectReason> {
        let total_len = header.total_len();
        if total_len as usize > self.limits.max_frame_len {
            return Err(RejectReason::FrameTooLarge(total_len));
        }
        if header.count() == 0 || header.index() >= header.count() {
            return Err(RejectReason::IndexOutOfRange);
        }
        if total_len < header.count() as u32 {
            return Err(RejectReason::LengthBelowCount);
        }
        Ok(())
    }

    fn reject(&mut self, seq: u32, reason: RejectReason) -> Outcome {
        self.pending.remove(&seq);
        self.counters.rejected += 1;
        tracing::debug!(seq, %reason, "discarding frame");
        Outcome::Rejected(reason)
    }

    fn complete(&mut self, seq: u32) {
        self.last_completed = Some(seq);
        self.counters.completed += 1;
        // Anything older can no longer be delivered.
        let newer = self.pending.split_off(&seq);
        self.counters.evicted += self.pending.len() as u64;
        self.pending = newer;
    }

    fn prune_behind_window(&mut self) {
        let (Some(highest), max) = (self.highest_seen, self.limits.max_pending) else {
            return;
        };
        let before = self.pending.len();
        self.pending
            .retain(|&seq, _| ((highest - seq) as usize) < max);
        self.counters.evicted += (before - self.pending.len()) as u64;
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.limits.max_pending {
            let Some((seq, _)) = self.pending.pop_first() else {
                break;
            };
            self.counters.evicted += 1;
            tracing::debug!(seq, "evicting oldest incomplete frame");
        }
    }
}
