//! Datagram ingest — receives fragments and handshakes on one UDP socket.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{DatagramSession, DropReason, Ingest, Multiplexer, RelayStats};

/// Large enough for any UDP payload, so nothing is silently truncated.
const RECV_BUF_LEN: usize = 65_536;

/// Kernel receive buffer. A burst of fragments from one frame must fit.
const SO_RCVBUF: usize = 1 << 20;

const MIN_EXPIRY_TICK: Duration = Duration::from_millis(10);

/// Create the ingest socket.
pub fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if let Err(e) = socket.set_recv_buffer_size(SO_RCVBUF) {
        tracing::warn!(error = %e, "could not enlarge receive buffer");
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register UDP socket")
}

pub struct DatagramIngest {
    socket: UdpSocket,
    session: DatagramSession,
    mux: Multiplexer,
    stats: RelayStatsHandle,
    expiry_tick: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl DatagramIngest {
    pub fn new(
        socket: UdpSocket,
        session: DatagramSession,
        mux: Multiplexer,
        stats: RelayStatsHandle,
        fragment_ttl: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            socket,
            session,
            mux,
            stats,
            expiry_tick: (fragment_ttl / 2).max(MIN_EXPIRY_TICK),
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut expiry = tokio::time::interval(self.expiry_tick);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("datagram ingest shutting down");
                    return Ok(());
                }

                _ = expiry.tick() => {
                    let expired = self.session.expire(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "dropped incomplete frames");
                    }
                    self.sync_counters();
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors surface here on some platforms; the socket stays usable.
                            tracing::debug!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    RelayStats::inc(&self.stats.datagrams_received);
                    let ingest = self.session.handle(from, &buf[..len], Instant::now());
                    self.apply(from, ingest, &buf[..len]);
                    self.sync_counters();
                }
            }
        }
    }

    fn apply(&self, from: SocketAddr, ingest: Ingest, datagram: &[u8]) {
        match ingest {
            Ingest::Frame(frame) => {
                RelayStats::inc(&self.stats.datagram_frames);
                super::publish(&self.mux, &self.stats, frame);
            }
            Ingest::Handshake {
                peer,
                epoch,
                replaced,
            } => {
                RelayStats::inc(&self.stats.handshakes);
                self.stats.set_datagram_producer(Some(peer));
                match replaced {
                    Some(old) => {
                        RelayStats::inc(&self.stats.producer_sessions);
                        tracing::info!(%peer, %old, epoch, "datagram producer replaced");
                    }
                    None if epoch == 1 => {
                        RelayStats::inc(&self.stats.producer_sessions);
                        tracing::info!(%peer, "datagram producer handshake");
                    }
                    None => tracing::debug!(%peer, epoch, "datagram session refreshed"),
                }
            }
            Ingest::Pending => {}
            Ingest::Dropped(reason) => {
                RelayStats::inc(&self.stats.datagrams_dropped);
                match reason {
                    DropReason::BadSecret => {
                        tracing::warn!(%from, "handshake with wrong secret")
                    }
                    DropReason::Malformed(e) => tracing::debug!(
                        %from,
                        error = %e,
                        head = %hex::encode(&datagram[..datagram.len().min(16)]),
                        "malformed datagram"
                    ),
                    DropReason::Rejected(r) => {
                        tracing::debug!(%from, reason = %r, "frame discarded")
                    }
                    other => tracing::trace!(%from, reason = %other, "datagram dropped"),
                }
            }
        }
    }

    fn sync_counters(&self) {
        let c = self.session.counters();
        self.stats.expired_sets.store(c.expired, Ordering::Relaxed);
        self.stats.evicted_sets.store(c.evicted, Ordering::Relaxed);
    }
}
