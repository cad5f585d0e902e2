//! Stream ingest — accepts the producer's TCP connection and deframes it.
//!
//! There is one producer. A new connection supersedes the current one: its
//! task is aborted and its partial frame discarded. Frames already published
//! stay in the viewers' mailboxes.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use camrelay_core::Frame;
use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{Multiplexer, RelayStats, StreamDeframer};

const READ_CHUNK: usize = 8192;

pub struct StreamIngest {
    listener: TcpListener,
    mux: Multiplexer,
    stats: RelayStatsHandle,
    max_buffer: usize,
    idle_timeout: Option<Duration>,
    shutdown: broadcast::Receiver<()>,
}

impl StreamIngest {
    pub fn new(
        listener: TcpListener,
        mux: Multiplexer,
        stats: RelayStatsHandle,
        max_buffer: usize,
        idle_timeout: Option<Duration>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            mux,
            stats,
            max_buffer,
            idle_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut current: Option<(SocketAddr, JoinHandle<()>)> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("stream ingest shutting down");
                    if let Some((_, task)) = current.take() {
                        task.abort();
                    }
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (socket, peer) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    if let Some((old_peer, task)) = current.take() {
                        if !task.is_finished() {
                            tracing::info!(old = %old_peer, new = %peer, "new producer connection supersedes current one");
                        }
                        task.abort();
                    }

                    RelayStats::inc(&self.stats.producer_sessions);
                    tracing::info!(%peer, "stream producer connected");

                    let session = ProducerConnection::new(
                        socket,
                        peer,
                        self.mux.clone(),
                        self.stats.clone(),
                        self.max_buffer,
                        self.idle_timeout,
                    );
                    let task = tokio::spawn(async move {
                        match session.run().await {
                            Ok(frames) => tracing::info!(%peer, frames, "stream producer disconnected"),
                            Err(e) => tracing::warn!(%peer, error = %e, "stream producer dropped"),
                        }
                    });
                    current = Some((peer, task));
                }
            }
        }
    }
}

/// One producer byte stream, pushed or pulled, read until it ends.
pub(super) struct ProducerConnection {
    socket: TcpStream,
    peer: SocketAddr,
    mux: Multiplexer,
    stats: RelayStatsHandle,
    deframer: StreamDeframer,
    idle_timeout: Option<Duration>,
}

impl ProducerConnection {
    pub(super) fn new(
        socket: TcpStream,
        peer: SocketAddr,
        mux: Multiplexer,
        stats: RelayStatsHandle,
        max_buffer: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            socket,
            peer,
            mux,
            stats,
            deframer: StreamDeframer::new(max_buffer),
            idle_timeout,
        }
    }

    /// Read until EOF. Returns the number of frames published.
    pub(super) async fn run(mut self) -> Result<u64> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut seq: u32 = 0;
        let mut seen = self.deframer.counters();

        loop {
            let read = self.socket.read(&mut buf);
            let n = match self.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .with_context(|| format!("no data from {} for {}s", self.peer, limit.as_secs()))?,
                None => read.await,
            }
            .context("stream read failed")?;

            if n == 0 {
                return Ok(self.deframer.counters().frames);
            }

            for payload in self.deframer.push(&buf[..n]) {
                RelayStats::inc(&self.stats.stream_frames);
                super::publish(&self.mux, &self.stats, Frame::new(seq, payload));
                seq = seq.wrapping_add(1);
            }

            let now = self.deframer.counters();
            if now.resyncs > seen.resyncs {
                RelayStats::add(&self.stats.stream_resyncs, now.resyncs - seen.resyncs);
            }
            if now.bytes_discarded > seen.bytes_discarded {
                RelayStats::add(
                    &self.stats.stream_bytes_discarded,
                    now.bytes_discarded - seen.bytes_discarded,
                );
            }
            seen = now;
        }
    }
}
