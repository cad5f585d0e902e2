//! Viewer server — one TCP connection and one consumer slot per viewer.
//!
//! Viewers receive raw frame bytes back to back, the same format the stream
//! producer sends. Anything a viewer sends is read and ignored; EOF or a read
//! error ends its session. A viewer whose write stalls past the timeout is
//! disconnected; it only ever delays itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{ConsumerSlot, Multiplexer, RelayStats};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ViewerServer {
    listener: TcpListener,
    mux: Multiplexer,
    stats: RelayStatsHandle,
    shutdown: broadcast::Receiver<()>,
}

impl ViewerServer {
    pub fn new(
        listener: TcpListener,
        mux: Multiplexer,
        stats: RelayStatsHandle,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            mux,
            stats,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("viewer server shutting down");
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

                    let slot = match self.mux.attach(peer) {
                        Ok(slot) => slot,
                        Err(e) => {
                            RelayStats::inc(&self.stats.viewers_refused);
                            tracing::warn!(%peer, error = %e, "viewer refused");
                            continue;
                        }
                    };
                    RelayStats::inc(&self.stats.viewers_attached);
                    tracing::info!(%peer, id = slot.id(), viewers = self.mux.consumer_count(), "viewer attached");

                    let mux = self.mux.clone();
                    let shutdown = self.shutdown.resubscribe();
                    tokio::spawn(async move {
                        let id = slot.id();
                        let result = deliver(socket, &slot, shutdown).await;
                        mux.detach(id);
                        match result {
                            Ok(()) => tracing::info!(%peer, id, delivered = slot.delivered(), "viewer left"),
                            Err(e) => tracing::info!(%peer, id, error = %e, "viewer dropped"),
                        }
                    });
                }
            }
        }
    }
}

/// Pump frames from `slot` to the viewer until either side goes away.
async fn deliver(
    socket: TcpStream,
    slot: &Arc<ConsumerSlot>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    socket.set_nodelay(true).context("TCP_NODELAY")?;
    let (mut reader, mut writer) = socket.into_split();
    let mut scratch = [0u8; 256];

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),

            frame = slot.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let write = tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(frame.payload()));
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    written = write => {
                        written.context("write stalled")?.context("write failed")?;
                    }
                }
            }

            read = reader.read(&mut scratch) => {
                match read {
                    Ok(0) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e).context("viewer read failed"),
                }
            }
        }
    }
}
