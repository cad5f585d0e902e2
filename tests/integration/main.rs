//! camrelay integration test harness.
//!
//! Every test runs a real relay in-process on loopback sockets with
//! OS-assigned ports, so tests need no setup and can run in parallel.
//!
//!   cargo test --test integration
//!
//! Each test owns its relay; dropping the TestRelay shuts it down.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use camrelay_core::config::CamrelayConfig;
use camrelay_services::stats::RelayStatsHandle;
use camrelay_services::{FrameSource, Multiplexer, StreamDeframer};
use camrelayd::{Relay, RelayAddrs};

mod datagram;
mod pull;
mod supervisor;
mod viewers;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SECRET: &str = "CAMRELAY";
pub const WAIT: Duration = Duration::from_secs(3);

/// A running relay. Shut down on drop.
pub struct TestRelay {
    pub addrs: RelayAddrs,
    pub mux: Multiplexer,
    pub stats: RelayStatsHandle,
    pub config: CamrelayConfig,
    shutdown: broadcast::Sender<()>,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Loopback config with OS-assigned TCP ports and a free UDP port.
pub fn test_config() -> CamrelayConfig {
    let mut config = CamrelayConfig::default();
    config.relay.ingest_host = "127.0.0.1".to_string();
    config.relay.viewer_host = "127.0.0.1".to_string();
    config.relay.stream_port = 0;
    config.relay.datagram_port = free_udp_port();
    config.relay.viewer_port = 0;
    config.relay.status_port = 0;
    config.relay.stats_interval_secs = 0;
    config.relay.secret = SECRET.to_string();
    config
}

/// A datagram port of 0 disables the transport, so tests reserve one.
pub fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("no free UDP port")
}

pub async fn start_relay_with(config: CamrelayConfig) -> Result<TestRelay> {
    let relay = Relay::bind(config.clone()).await?;
    let addrs = relay.local_addrs()?;
    let mux = relay.mux().clone();
    let stats = relay.stats().clone();
    let (shutdown, _) = broadcast::channel(1);
    relay.spawn(&shutdown);
    Ok(TestRelay {
        addrs,
        mux,
        stats,
        config,
        shutdown,
    })
}

pub async fn start_relay() -> Result<TestRelay> {
    start_relay_with(test_config()).await
}

/// A marker-bracketed frame whose body encodes `id` and is `len` bytes long
/// in total. Body bytes stay below 0xFF, so no marker appears inside.
pub fn test_frame(id: u32, len: usize) -> Vec<u8> {
    assert!(len >= 8);
    let mut frame = vec![0xFF, 0xD8];
    frame.extend(id.to_be_bytes().iter().map(|b| b & 0x7F));
    frame.extend((0..len - 8).map(|i| (i % 0x7F) as u8));
    frame.extend_from_slice(&[0xFF, 0xD9]);
    frame
}

/// The id a frame from `test_frame` carries.
pub fn frame_id(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]])
}

/// Frame source emitting `test_frame` frames with increasing ids.
pub struct Counter {
    next: u32,
    len: usize,
}

impl Counter {
    pub fn new(len: usize) -> Self {
        Self { next: 0, len }
    }
}

impl FrameSource for Counter {
    fn capture(&mut self) -> anyhow::Result<Bytes> {
        self.next += 1;
        Ok(Bytes::from(test_frame(self.next, self.len)))
    }
}

/// A viewer connection that splits its byte stream back into frames.
pub struct ViewerClient {
    socket: TcpStream,
    deframer: StreamDeframer,
    ready: std::collections::VecDeque<Bytes>,
}

impl ViewerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let socket = TcpStream::connect(addr).await.context("viewer connect")?;
        Ok(Self {
            socket,
            deframer: StreamDeframer::new(16 * 1024 * 1024),
            ready: Default::default(),
        })
    }

    /// Next complete frame, or an error after `WAIT`.
    pub async fn next_frame(&mut self) -> Result<Bytes> {
        tokio::time::timeout(WAIT, self.read_frame())
            .await
            .context("timed out waiting for a frame")?
    }

    /// Keep reading until a frame with `id` arrives. Earlier frames may be
    /// skipped by the relay; anything after `id` is a failure.
    pub async fn frame_with_id(&mut self, id: u32) -> Result<Bytes> {
        loop {
            let frame = self.next_frame().await?;
            match frame_id(&frame) {
                got if got == id => return Ok(frame),
                got if got > id => bail!("expected frame {id}, got newer frame {got}"),
                _ => continue,
            }
        }
    }

    /// True if no frame arrives within `wait`.
    pub async fn stays_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.read_frame()).await.is_err()
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(frame);
            }
            let n = self.socket.read(&mut buf).await?;
            if n == 0 {
                bail!("relay closed the viewer connection");
            }
            self.ready.extend(self.deframer.push(&buf[..n]));
        }
    }
}

/// Read a handful of frames and check ids only move forward.
pub async fn expect_progress(viewer: &mut ViewerClient, frames: usize) -> u32 {
    let mut last = 0;
    for _ in 0..frames {
        let frame = viewer.next_frame().await.unwrap();
        let id = frame_id(&frame);
        assert!(id > last, "frame {id} after {last}");
        last = id;
    }
    last
}

/// Wait until the relay has `n` viewers attached.
pub async fn wait_for_viewers(mux: &Multiplexer, n: usize) -> Result<()> {
    for _ in 0..300 {
        if mux.consumer_count() == n {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("expected {n} viewers, have {}", mux.consumer_count())
}

/// Minimal HTTP GET returning the parsed JSON body.
pub async fn http_get_json(addr: SocketAddr, path: &str) -> Result<serde_json::Value> {
    let mut conn = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    conn.read_to_string(&mut response).await?;
    let (head, body) = response
        .split_once("\r\n\r\n")
        .context("malformed HTTP response")?;
    if !head.starts_with("HTTP/1.1 200") {
        bail!("unexpected response: {head}");
    }
    serde_json::from_str(body).context("response is not JSON")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn relay_binds_every_listener() {
    let relay = start_relay().await.unwrap();
    assert_ne!(relay.addrs.stream.port(), 0);
    assert_ne!(relay.addrs.viewers.port(), 0);
    assert_eq!(
        relay.addrs.datagram.map(|a| a.port()),
        Some(relay.config.relay.datagram_port)
    );
}

#[tokio::test]
async fn datagram_port_zero_disables_transport() {
    let mut config = test_config();
    config.relay.datagram_port = 0;
    let relay = start_relay_with(config).await.unwrap();
    assert!(relay.addrs.datagram.is_none());
}
