//! Multiplexer — latest-wins fan-out of completed frames to viewers.
//!
//! Every viewer owns a ConsumerSlot: a one-frame mailbox. Publishing a frame
//! overwrites whatever the slot still holds, so a slow viewer skips frames
//! instead of building a backlog, and the ingest task never waits on any
//! viewer. Each publication carries a generation number; a slot only accepts
//! generations newer than the last one it saw.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;

use camrelay_core::Frame;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("viewer limit of {0} reached")]
    TooManyConsumers(usize),
}

// ── Consumer Slot ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    pending: Option<Frame>,
    last_gen: u64,
}

pub struct ConsumerSlot {
    id: u64,
    peer: SocketAddr,
    attached_at: Instant,
    mailbox: Mutex<Mailbox>,
    notify: Notify,
    closed: AtomicBool,
    delivered: AtomicU64,
    overwritten: AtomicU64,
}

/// Point-in-time view of one slot, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub id: u64,
    pub peer: String,
    pub attached_secs: u64,
    pub delivered: u64,
    pub overwritten: u64,
}

impl ConsumerSlot {
    fn new(id: u64, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            attached_at: Instant::now(),
            mailbox: Mutex::new(Mailbox::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Place a frame in the mailbox, replacing any undelivered one.
    /// Returns false if the slot is closed or already saw a newer generation.
    pub fn offer(&self, gen: u64, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut mailbox = self.lock();
            if gen <= mailbox.last_gen {
                return false;
            }
            if mailbox.pending.replace(frame).is_some() {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            }
            mailbox.last_gen = gen;
        }
        self.notify.notify_one();
        true
    }

    /// Take the pending frame without waiting.
    pub fn take(&self) -> Option<Frame> {
        let frame = self.lock().pending.take();
        if frame.is_some() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Wait for the next frame. Returns None once the slot is closed.
    pub async fn next(&self) -> Option<Frame> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.take() {
                return Some(frame);
            }
            // notify_one stores a permit, so an offer racing this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Close the slot and wake its reader.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().pending = None;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            id: self.id,
            peer: self.peer.to_string(),
            attached_secs: self.attached_at.elapsed().as_secs(),
            delivered: self.delivered(),
            overwritten: self.overwritten(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConsumerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSlot")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

struct Inner {
    slots: DashMap<u64, Arc<ConsumerSlot>>,
    latest: RwLock<Option<(u64, Frame)>>,
    next_id: AtomicU64,
    next_gen: AtomicU64,
    /// Slots reserved against `max_consumers`, taken before insertion.
    reserved: AtomicUsize,
    max_consumers: usize,
}

/// Shared handle. Clones refer to the same set of slots.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    pub fn new(max_consumers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                latest: RwLock::new(None),
                next_id: AtomicU64::new(1),
                next_gen: AtomicU64::new(1),
                reserved: AtomicUsize::new(0),
                max_consumers,
            }),
        }
    }

    /// Register a viewer. The most recent frame, if any, is waiting in the
    /// new slot immediately.
    pub fn attach(&self, peer: SocketAddr) -> Result<Arc<ConsumerSlot>, MuxError> {
        let max = self.inner.max_consumers;
        self.inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| MuxError::TooManyConsumers(max))?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ConsumerSlot::new(id, peer));
        // Insert before reading `latest`: a concurrent publish either sees
        // the slot or has already updated `latest`.
        self.inner.slots.insert(id, slot.clone());
        let latest = self
            .inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((gen, frame)) = latest {
            slot.offer(gen, frame);
        }
        Ok(slot)
    }

    /// Remove and close a slot. A no-op for unknown ids.
    pub fn detach(&self, id: u64) {
        if let Some((_, slot)) = self.inner.slots.remove(&id) {
            slot.close();
            self.inner.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Offer a frame to every slot. Never blocks on a viewer. Returns the
    /// number of slots that accepted it.
    pub fn publish(&self, frame: Frame) -> usize {
        let gen = {
            let mut latest = self
                .inner
                .latest
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let gen = self.inner.next_gen.fetch_add(1, Ordering::Relaxed);
            *latest = Some((gen, frame.clone()));
            gen
        };
        let slots: Vec<Arc<ConsumerSlot>> =
            self.inner.slots.iter().map(|e| e.value().clone()).collect();
        slots
            .iter()
            .filter(|slot| slot.offer(gen, frame.clone()))
            .count()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, frame)| frame.clone())
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn max_consumers(&self) -> usize {
        self.inner.max_consumers
    }

    /// Snapshots of every attached slot, ordered by id.
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        let mut infos: Vec<ConsumerInfo> =
            self.inner.slots.iter().map(|e| e.value().info()).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}
