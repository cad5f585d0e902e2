//! Producer link — the one connection from the camera to the relay.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpStream, UdpSocket};
use zerocopy::AsBytes;

use camrelay_core::config::TransportKind;
use camrelay_core::wire::Handshake;

use crate::framer::{stream_frame, DatagramFramer, FramerError};
use crate::supervisor::ProducerSettings;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, std::io::Error),
    #[error("{0} resolved to no addresses")]
    NoAddress(String),
    #[error("failed to connect to {0}: {1}")]
    Connect(SocketAddr, std::io::Error),
    #[error("timed out connecting to {0}")]
    Timeout(SocketAddr),
    #[error("link I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame not sendable: {0}")]
    Framing(#[from] FramerError),
}

impl LinkError {
    /// Framing errors concern one frame; everything else means the link is gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LinkError::Framing(_))
    }
}

pub struct DatagramLink {
    socket: UdpSocket,
    framer: DatagramFramer,
    handshake: Handshake,
    last_handshake: Instant,
    rehandshake: Option<Duration>,
}

impl DatagramLink {
    /// Send the handshake and restart sequence numbers at 0.
    async fn handshake(&mut self, now: Instant) -> Result<(), LinkError> {
        self.socket.send(self.handshake.as_bytes()).await?;
        self.framer.reset();
        self.last_handshake = now;
        Ok(())
    }

    pub fn next_seq(&self) -> u32 {
        self.framer.next_seq()
    }
}

pub enum Link {
    Stream(TcpStream),
    Datagram(DatagramLink),
}

impl Link {
    /// Establish the link. For the datagram transport this includes the
    /// handshake, so a returned link is ready to carry frame 0.
    pub async fn connect(settings: &ProducerSettings) -> Result<Link, LinkError> {
        let target = format!("{}:{}", settings.host, settings.port);
        let addr = lookup_host(&target)
            .await
            .map_err(|e| LinkError::Resolve(target.clone(), e))?
            .next()
            .ok_or_else(|| LinkError::NoAddress(target.clone()))?;

        match settings.transport {
            TransportKind::Stream => {
                let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| LinkError::Timeout(addr))?
                    .map_err(|e| LinkError::Connect(addr, e))?;
                stream.set_nodelay(true)?;
                Ok(Link::Stream(stream))
            }
            TransportKind::Datagram => {
                let local: SocketAddr = if addr.is_ipv4() {
                    SocketAddr::from(([0, 0, 0, 0], 0))
                } else {
                    SocketAddr::from(([0u16; 8], 0))
                };
                let socket = UdpSocket::bind(local).await?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| LinkError::Connect(addr, e))?;
                let mut link = DatagramLink {
                    socket,
                    framer: DatagramFramer::new(settings.max_fragment_payload)?,
                    handshake: Handshake::new(settings.secret),
                    last_handshake: Instant::now(),
                    rehandshake: settings.rehandshake,
                };
                link.handshake(Instant::now()).await?;
                Ok(Link::Datagram(link))
            }
        }
    }

    /// Wait up to `wait` for the relay to dial in. `None` if nobody did.
    pub async fn accept(listener: &TcpListener, wait: Duration) -> Result<Option<Link>, LinkError> {
        let Ok(accepted) = tokio::time::timeout(wait, listener.accept()).await else {
            return Ok(None);
        };
        let (stream, _) = accepted?;
        stream.set_nodelay(true)?;
        Ok(Some(Link::Stream(stream)))
    }

    /// Send one frame. Returns the number of frame bytes sent.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<usize, LinkError> {
        match self {
            Link::Stream(stream) => {
                let frame = stream_frame(frame)?;
                stream.write_all(frame).await?;
                Ok(frame.len())
            }
            Link::Datagram(link) => {
                for datagram in link.framer.encode(frame)? {
                    link.socket.send(&datagram).await?;
                }
                Ok(frame.len())
            }
        }
    }

    /// Periodic upkeep. Re-sends the datagram handshake once the refresh
    /// interval has passed, so a restarted relay picks the session back up.
    /// Returns true if a handshake went out.
    pub async fn maintain(&mut self, now: Instant) -> Result<bool, LinkError> {
        let Link::Datagram(link) = self else {
            return Ok(false);
        };
        let Some(every) = link.rehandshake else {
            return Ok(false);
        };
        if now.saturating_duration_since(link.last_handshake) < every {
            return Ok(false);
        }
        link.handshake(now).await?;
        Ok(true)
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            Link::Stream(_) => TransportKind::Stream,
            Link::Datagram(_) => TransportKind::Datagram,
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Link::Stream(stream) => stream.peer_addr(),
            Link::Datagram(link) => link.socket.peer_addr(),
        }
    }
}
