//! Datagram session — the relay's handshake state machine for one producer.
//!
//! Two states. While awaiting a handshake every fragment is dropped. A
//! handshake carrying the configured secret moves the session to Active for
//! the sending address and wipes all reassembly state, so sequence numbers
//! restart at 0 without colliding with fragments still in flight from the
//! previous session. A later valid handshake (same producer reconnecting, or a
//! new producer taking over) starts a fresh epoch the same way.

use std::net::SocketAddr;
use std::time::Instant;

use camrelay_core::wire::{Datagram, Secret, WireError};
use camrelay_core::Frame;

use crate::reassembly::{Outcome, ReassemblyCounters, Reassembler, ReassemblyLimits, RejectReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Active {
        peer: SocketAddr,
        since: Instant,
        /// Incremented on every accepted handshake.
        epoch: u64,
    },
}

/// What one datagram amounted to.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingest {
    Frame(Frame),
    Handshake {
        peer: SocketAddr,
        epoch: u64,
        /// Producer this handshake displaced, if it came from a new address.
        replaced: Option<SocketAddr>,
    },
    Pending,
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    #[error("malformed datagram: {0}")]
    Malformed(#[from] WireError),
    #[error("handshake with wrong secret")]
    BadSecret,
    #[error("fragment before any handshake")]
    NoSession,
    #[error("fragment from an address other than the active producer")]
    ForeignPeer,
    #[error("stale fragment")]
    Stale,
    #[error("duplicate fragment")]
    Duplicate,
    #[error("frame discarded: {0}")]
    Rejected(RejectReason),
}

pub struct DatagramSession {
    secret: Secret,
    state: SessionState,
    epochs: u64,
    reassembler: Reassembler,
}

impl DatagramSession {
    pub fn new(secret: Secret, limits: ReassemblyLimits) -> Self {
        Self {
            secret,
            state: SessionState::AwaitingHandshake,
            epochs: 0,
            reassembler: Reassembler::new(limits),
        }
    }

    /// Classify one datagram from `from` and advance the session.
    pub fn handle(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) -> Ingest {
        let parsed = match Datagram::parse(datagram) {
            Ok(parsed) => parsed,
            Err(e) => return Ingest::Dropped(e.into()),
        };

        match parsed {
            Datagram::Handshake(hs) => {
                if hs.secret != self.secret {
                    return Ingest::Dropped(DropReason::BadSecret);
                }
                let replaced = match &self.state {
                    SessionState::Active { peer, .. } if *peer != from => Some(*peer),
                    _ => None,
                };
                self.epochs += 1;
                self.reassembler.reset();
                self.state = SessionState::Active {
                    peer: from,
                    since: now,
                    epoch: self.epochs,
                };
                Ingest::Handshake {
                    peer: from,
                    epoch: self.epochs,
                    replaced,
                }
            }
            Datagram::Fragment { header, payload } => {
                match &self.state {
                    SessionState::AwaitingHandshake => {
                        return Ingest::Dropped(DropReason::NoSession)
                    }
                    SessionState::Active { peer, .. } if *peer != from => {
                        return Ingest::Dropped(DropReason::ForeignPeer)
                    }
                    SessionState::Active { .. } => {}
                }
                match self.reassembler.accept(&header, payload, now) {
                    Outcome::Complete(frame) => Ingest::Frame(frame),
                    Outcome::Pending => Ingest::Pending,
                    Outcome::Duplicate => Ingest::Dropped(DropReason::Duplicate),
                    Outcome::Stale => Ingest::Dropped(DropReason::Stale),
                    Outcome::Rejected(reason) => Ingest::Dropped(DropReason::Rejected(reason)),
                }
            }
        }
    }

    /// Expire idle fragment sets. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.reassembler.expire(now)
    }

    /// Back to awaiting a handshake.
    pub fn reset(&mut self) {
        self.state = SessionState::AwaitingHandshake;
        self.reassembler.reset();
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self.state {
            SessionState::Active { peer, .. } => Some(peer),
            SessionState::AwaitingHandshake => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.reassembler.pending()
    }

    pub fn counters(&self) -> ReassemblyCounters {
        self.reassembler.counters()
    }
}
