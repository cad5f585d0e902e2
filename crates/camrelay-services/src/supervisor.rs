//! Connection supervisor — drives capture, pacing and the producer link.
//!
//! State machine:
//!
//!   Disconnected ──(retry delay elapsed)──▶ Connecting
//!   Connecting   ──(link up, handshake sent)──▶ Connected
//!   Connecting   ──(failure)──▶ Disconnected
//!   Connected    ──(any I/O failure)──▶ Disconnected
//!
//! The retry delay is fixed. Entering Connected clears every per-session
//! counter and the frame-rate window.
//!
//! A supervisor built with [`Supervisor::serving`] reverses the direction:
//! Connecting means waiting for the relay to dial in on the camera's own
//! listener, one relay at a time. Everything after the link is up is the same.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use camrelay_core::config::{ProducerConfig, TransportKind};
use camrelay_core::wire::{self, Secret};

use crate::link::{Link, LinkError};
use crate::rate::RateGovernor;
use crate::stats::LinkStats;

/// Pause after a failed capture when pacing is off, so a broken source does
/// not spin.
const CAPTURE_BACKOFF: Duration = Duration::from_millis(100);

/// Supplies encoded frames. Implemented by the camera backend.
pub trait FrameSource: Send {
    fn capture(&mut self) -> anyhow::Result<Bytes>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Result of one supervisor iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A frame went out.
    Sent { bytes: usize },
    /// Nothing to do before the given time passes.
    Idle(Duration),
    /// The source produced no frame. Retried on the next tick.
    CaptureFailed,
    /// The frame could not be framed for this transport and was dropped.
    Skipped,
    /// The link failed. Reconnecting after the retry delay.
    SendFailed,
    /// A connect attempt failed. Retrying after the retry delay.
    Reconnecting,
    /// The link just came up.
    Connected,
    /// Serving, and no relay dialed in yet. Listening again next step.
    Listening,
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub target_fps: f64,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub max_fragment_payload: usize,
    pub rehandshake: Option<Duration>,
    pub secret: Secret,
    pub stats_interval: Option<Duration>,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self::from_config(&ProducerConfig::default())
    }
}

impl ProducerSettings {
    pub fn from_config(config: &ProducerConfig) -> Self {
        Self {
            host: config.relay_host.clone(),
            port: config.effective_port(),
            transport: config.transport,
            target_fps: config.target_fps,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            connect_timeout: Duration::from_secs(5),
            max_fragment_payload: config.max_fragment_payload,
            rehandshake: (config.rehandshake_secs > 0)
                .then(|| Duration::from_secs(config.rehandshake_secs)),
            secret: wire::secret_from_str(&config.secret),
            stats_interval: Some(Duration::from_secs(30)),
        }
    }
}

pub struct Supervisor<S> {
    settings: ProducerSettings,
    source: S,
    link: Option<Link>,
    listener: Option<TcpListener>,
    state: LinkState,
    governor: RateGovernor,
    last_emit: Option<Instant>,
    retry_at: Option<Instant>,
    stats: LinkStats,
}

impl<S: FrameSource> Supervisor<S> {
    pub fn new(settings: ProducerSettings, source: S) -> Self {
        let governor = RateGovernor::new(settings.target_fps);
        Self {
            settings,
            source,
            link: None,
            listener: None,
            state: LinkState::Disconnected,
            governor,
            last_emit: None,
            retry_at: None,
            stats: LinkStats::default(),
        }
    }

    /// Serve frames to whichever relay dials `listener`, instead of dialing
    /// out. Serving always uses the stream transport.
    pub fn serving(mut settings: ProducerSettings, source: S, listener: TcpListener) -> Self {
        settings.transport = TransportKind::Stream;
        let mut sup = Self::new(settings, source);
        sup.listener = Some(listener);
        sup
    }

    /// One iteration. Never sleeps; waits are returned as `Step::Idle`.
    pub async fn step(&mut self) -> Step {
        let now = Instant::now();

        let Some(link) = self.link.as_mut() else {
            return self.connect(now).await;
        };

        if let Err(e) = link.maintain(now).await {
            return self.link_failed(now, e);
        }

        let wait = self.governor.wait_time(self.last_emit, now);
        if !wait.is_zero() {
            return Step::Idle(wait);
        }

        let frame = match self.source.capture() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "capture failed");
                self.stats.capture_failures += 1;
                self.last_emit = Some(now);
                return Step::CaptureFailed;
            }
        };

        match link.send_frame(&frame).await {
            Ok(bytes) => {
                self.last_emit = Some(now);
                self.stats.on_sent(bytes, now);
                Step::Sent { bytes }
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, len = frame.len(), "frame skipped");
                self.last_emit = Some(now);
                self.stats.skipped += 1;
                Step::Skipped
            }
            Err(e) => self.link_failed(now, e),
        }
    }

    /// Run until shutdown. Connection failures are retried forever.
    ///
    /// A step always runs to completion unless shutdown fires, so a frame is
    /// never cut short on a link that stays up. Stats are logged between steps.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut next_stats = self.settings.stats_interval.map(|every| Instant::now() + every);
        match self.listener.as_ref().map(|l| l.local_addr()) {
            Some(listen) => tracing::info!(
                listen = %listen.map(|a| a.to_string()).unwrap_or_default(),
                fps = self.settings.target_fps,
                "producer serving, waiting for relay"
            ),
            None => tracing::info!(
                relay = %format!("{}:{}", self.settings.host, self.settings.port),
                transport = %self.settings.transport,
                fps = self.settings.target_fps,
                "producer starting"
            ),
        }

        loop {
            let step = tokio::select! {
                _ = shutdown.recv() => break,
                step = self.step() => step,
            };

            if let (Some(at), Some(every)) = (next_stats, self.settings.stats_interval) {
                let now = Instant::now();
                if now >= at {
                    self.log_stats();
                    next_stats = Some(now + every);
                }
            }

            let pause = match step {
                Step::Idle(wait) => wait,
                Step::CaptureFailed if self.governor.interval().is_none() => CAPTURE_BACKOFF,
                _ => Duration::ZERO,
            };
            if !pause.is_zero() {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        tracing::info!(frames = self.stats.frames_sent, "producer stopped");
        Ok(())
    }

    /// Change the frame rate. Applies from the next frame on.
    pub fn set_target_fps(&mut self, fps: f64) {
        self.governor.set_target_fps(fps);
        self.settings.target_fps = fps;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    async fn connect(&mut self, now: Instant) -> Step {
        if let Some(at) = self.retry_at {
            let wait = at.saturating_duration_since(now);
            if !wait.is_zero() {
                return Step::Idle(wait);
            }
        }

        self.state = LinkState::Connecting;
        let attempt = match &self.listener {
            Some(listener) => Link::accept(listener, self.settings.connect_timeout).await,
            None => Link::connect(&self.settings).await.map(Some),
        };
        match attempt {
            Ok(None) => {
                self.state = LinkState::Disconnected;
                Step::Listening
            }
            Ok(Some(link)) => {
                tracing::info!(
                    peer = %link.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
                    transport = %link.transport(),
                    "connected to relay"
                );
                self.link = Some(link);
                self.state = LinkState::Connected;
                self.retry_at = None;
                self.last_emit = None;
                self.stats.on_connected();
                Step::Connected
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_ms = self.settings.retry_delay.as_millis() as u64,
                    "connect failed"
                );
                self.schedule_retry(now);
                Step::Reconnecting
            }
        }
    }

    fn link_failed(&mut self, now: Instant, e: LinkError) -> Step {
        tracing::warn!(
            error = %e,
            frames = self.stats.frames_sent,
            "link lost, reconnecting"
        );
        self.link = None;
        self.stats.send_failures += 1;
        self.schedule_retry(now);
        Step::SendFailed
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.state = LinkState::Disconnected;
        self.retry_at = Some(now + self.settings.retry_delay);
    }

    fn log_stats(&self) {
        tracing::info!(
            state = ?self.state,
            frames = self.stats.frames_sent,
            bytes = self.stats.bytes_sent,
            fps = %format!("{:.1}", self.stats.fps.fps()),
            capture_failures = self.stats.capture_failures,
            skipped = self.stats.skipped,
            connects = self.stats.connects,
            "producer stats"
        );
    }
}
