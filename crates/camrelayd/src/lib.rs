//! camrelayd — camera frame relay.
//!
//! Accepts one producer over the stream transport (TCP) or the datagram
//! transport (UDP), rebuilds whole frames, and fans each one out to every
//! connected viewer. With `relay.camera_addr` set it also dials a camera that
//! serves the stream transport itself.

pub mod ingest;
pub mod status;
pub mod viewer;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use camrelay_core::config::CamrelayConfig;
use camrelay_core::wire;
use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{DatagramSession, Multiplexer, RelayStats, ReassemblyLimits};

use ingest::{DatagramIngest, PullIngest, StreamIngest};
use viewer::ViewerServer;

/// A relay with its sockets bound but no tasks running yet.
pub struct Relay {
    config: CamrelayConfig,
    stream: TcpListener,
    datagram: Option<UdpSocket>,
    viewers: TcpListener,
    mux: Multiplexer,
    stats: RelayStatsHandle,
}

/// Addresses actually bound. Ports configured as 0 show the OS choice here.
#[derive(Debug, Clone, Copy)]
pub struct RelayAddrs {
    pub stream: SocketAddr,
    pub datagram: Option<SocketAddr>,
    pub viewers: SocketAddr,
}

pub struct RelayTasks {
    pub stream: JoinHandle<Result<()>>,
    pub datagram: Option<JoinHandle<Result<()>>>,
    pub pull: Option<JoinHandle<Result<()>>>,
    pub viewers: JoinHandle<Result<()>>,
    pub stats_printer: Option<JoinHandle<()>>,
}

impl Relay {
    pub async fn bind(config: CamrelayConfig) -> Result<Self> {
        let relay = &config.relay;

        let stream_addr = format!("{}:{}", relay.ingest_host, relay.stream_port);
        let stream = TcpListener::bind(&stream_addr)
            .await
            .with_context(|| format!("failed to bind stream ingest on {stream_addr}"))?;

        let datagram = if relay.datagram_port == 0 {
            None
        } else {
            let addr: SocketAddr = format!("{}:{}", relay.ingest_host, relay.datagram_port)
                .parse()
                .context("ingest_host must be an IP address")?;
            Some(ingest::datagram::bind_socket(addr)?)
        };

        let viewer_addr = format!("{}:{}", relay.viewer_host, relay.viewer_port);
        let viewers = TcpListener::bind(&viewer_addr)
            .await
            .with_context(|| format!("failed to bind viewer listener on {viewer_addr}"))?;

        let mux = Multiplexer::new(relay.max_viewers);
        Ok(Self {
            config,
            stream,
            datagram,
            viewers,
            mux,
            stats: RelayStats::shared(),
        })
    }

    pub fn local_addrs(&self) -> Result<RelayAddrs> {
        Ok(RelayAddrs {
            stream: self.stream.local_addr()?,
            datagram: self.datagram.as_ref().map(|s| s.local_addr()).transpose()?,
            viewers: self.viewers.local_addr()?,
        })
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn stats(&self) -> &RelayStatsHandle {
        &self.stats
    }

    /// Spawn every relay task. All of them stop when `shutdown` fires.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> RelayTasks {
        let limits = &self.config.limits;
        let relay = &self.config.relay;

        let idle = (relay.producer_idle_secs > 0).then(|| Duration::from_secs(relay.producer_idle_secs));
        let stream = tokio::spawn(
            StreamIngest::new(
                self.stream,
                self.mux.clone(),
                self.stats.clone(),
                limits.max_stream_buffer,
                idle,
                shutdown.subscribe(),
            )
            .run(),
        );

        let datagram = self.datagram.map(|socket| {
            let ttl = Duration::from_millis(limits.fragment_ttl_ms);
            let session = DatagramSession::new(
                wire::secret_from_str(&relay.secret),
                ReassemblyLimits {
                    max_frame_len: limits.max_frame_len,
                    ttl,
                    max_pending: limits.max_pending_frames,
                    require_start_marker: true,
                },
            );
            tokio::spawn(
                DatagramIngest::new(
                    socket,
                    session,
                    self.mux.clone(),
                    self.stats.clone(),
                    ttl,
                    shutdown.subscribe(),
                )
                .run(),
            )
        });

        let pull = (!relay.camera_addr.is_empty()).then(|| {
            tokio::spawn(
                PullIngest::new(
                    relay.camera_addr.clone(),
                    self.mux.clone(),
                    self.stats.clone(),
                    limits.max_stream_buffer,
                    idle,
                    Duration::from_millis(relay.camera_retry_ms),
                    shutdown.subscribe(),
                )
                .run(),
            )
        });

        let viewers = tokio::spawn(
            ViewerServer::new(
                self.viewers,
                self.mux.clone(),
                self.stats.clone(),
                shutdown.subscribe(),
            )
            .run(),
        );

        let stats_printer = (relay.stats_interval_secs > 0).then(|| {
            let period = Duration::from_secs(relay.stats_interval_secs);
            let stats = self.stats.clone();
            let mux = self.mux.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    stats.log_summary(mux.consumer_count());
                }
            })
        });

        RelayTasks {
            stream,
            datagram,
            pull,
            viewers,
            stats_printer,
        }
    }

    pub fn status_state(&self) -> status::StatusState {
        status::StatusState {
            mux: self.mux.clone(),
            stats: self.stats.clone(),
            started: Instant::now(),
        }
    }
}
