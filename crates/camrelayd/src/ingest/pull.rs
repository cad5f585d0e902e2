//! Pull ingest — dials a camera that serves the stream transport.
//!
//! The relay holds at most one connection to the camera. When it fails or the
//! camera closes it, the relay waits a fixed delay and dials again, forever.
//! Bytes go through the same deframer and publish path as a pushed stream.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{Multiplexer, RelayStats};

use super::stream::ProducerConnection;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PullIngest {
    camera: String,
    mux: Multiplexer,
    stats: RelayStatsHandle,
    max_buffer: usize,
    idle_timeout: Option<Duration>,
    retry_delay: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl PullIngest {
    pub fn new(
        camera: String,
        mux: Multiplexer,
        stats: RelayStatsHandle,
        max_buffer: usize,
        idle_timeout: Option<Duration>,
        retry_delay: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            camera,
            mux,
            stats,
            max_buffer,
            idle_timeout,
            retry_delay,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            camera = %self.camera,
            retry_ms = self.retry_delay.as_millis() as u64,
            "pull ingest starting"
        );

        loop {
            let dialed = tokio::select! {
                _ = self.shutdown.recv() => break,
                dialed = dial(&self.camera) => dialed,
            };

            match dialed {
                Ok((socket, peer)) => {
                    RelayStats::inc(&self.stats.producer_sessions);
                    tracing::info!(%peer, "connected to camera");
                    let session = ProducerConnection::new(
                        socket,
                        peer,
                        self.mux.clone(),
                        self.stats.clone(),
                        self.max_buffer,
                        self.idle_timeout,
                    );
                    tokio::select! {
                        _ = self.shutdown.recv() => break,
                        ended = session.run() => match ended {
                            Ok(frames) => tracing::info!(%peer, frames, "camera closed the stream"),
                            Err(e) => tracing::warn!(%peer, error = %e, "camera stream dropped"),
                        },
                    }
                }
                Err(e) => tracing::warn!(camera = %self.camera, error = %e, "camera connect failed"),
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        tracing::info!("pull ingest shutting down");
        Ok(())
    }
}

async fn dial(camera: &str) -> Result<(TcpStream, SocketAddr)> {
    let socket = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(camera))
        .await
        .with_context(|| format!("timed out connecting to {camera}"))?
        .with_context(|| format!("failed to connect to {camera}"))?;
    let peer = socket.peer_addr().context("connected socket has no peer")?;
    Ok((socket, peer))
}
