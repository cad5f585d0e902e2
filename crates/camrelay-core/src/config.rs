//! Configuration system for camrelay.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAMRELAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/camrelay/config.toml
//!   3. ~/.config/camrelay/config.toml
//!
//! The relay daemon reads `[relay]` and `[limits]`; the camera daemon reads
//! `[producer]` and `[limits]`. Both share one file so a single-host setup
//! needs only one place to agree on ports and the shared secret.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamrelayConfig {
    pub relay: RelayConfig,
    pub producer: ProducerConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the producer-facing listeners bind to.
    pub ingest_host: String,
    /// TCP port for the stream transport.
    pub stream_port: u16,
    /// UDP port for the datagram transport. 0 = disabled.
    pub datagram_port: u16,
    /// Address the viewer listener binds to.
    pub viewer_host: String,
    /// TCP port viewers connect to.
    pub viewer_port: u16,
    /// Local HTTP status port. 0 = disabled.
    pub status_port: u16,
    /// Viewer connections beyond this are refused.
    pub max_viewers: usize,
    /// Seconds between statistics log lines. 0 = never.
    pub stats_interval_secs: u64,
    /// A stream producer silent for this long is dropped. 0 = never.
    pub producer_idle_secs: u64,
    /// Handshake secret expected from datagram producers.
    pub secret: String,
    /// `host:port` of a camera serving the stream transport. The relay dials
    /// it and keeps redialing. Empty = only accept pushed connections.
    pub camera_addr: String,
    /// Fixed delay before redialing the camera.
    pub camera_retry_ms: u64,
}

/// Transport the producer uses to reach the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportKind::Stream),
            "datagram" | "udp" => Ok(TransportKind::Datagram),
            other => Err(ConfigError::InvalidValue("producer.transport", other.to_string())),
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Datagram => write!(f, "datagram"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub relay_host: String,
    /// Relay port. 0 = the default port for the chosen transport.
    pub relay_port: u16,
    pub transport: TransportKind,
    /// Frames per second. 0 = as fast as capture allows.
    pub target_fps: f64,
    /// Fixed delay before every reconnect attempt.
    pub retry_delay_ms: u64,
    /// Payload bytes per datagram fragment.
    pub max_fragment_payload: usize,
    /// Seconds between handshake refreshes on the datagram link. 0 = never.
    pub rehandshake_secs: u64,
    pub secret: String,
    /// Directory of encoded frames the camera daemon cycles through.
    pub source_dir: PathBuf,
    /// Serve the stream transport on this port and wait for the relay to dial
    /// in, instead of dialing the relay. 0 = dial.
    pub listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Unclassified stream bytes held before a resync.
    pub max_stream_buffer: usize,
    /// Largest declared frame length accepted from a fragment header.
    pub max_frame_len: usize,
    /// An incomplete frame with no new fragment for this long is dropped.
    pub fragment_ttl_ms: u64,
    /// Frames reassembled at once. The oldest is evicted first.
    pub max_pending_frames: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ingest_host: "0.0.0.0".to_string(),
            stream_port: DEFAULT_STREAM_PORT,
            datagram_port: DEFAULT_DATAGRAM_PORT,
            viewer_host: "0.0.0.0".to_string(),
            viewer_port: DEFAULT_VIEWER_PORT,
            status_port: DEFAULT_STATUS_PORT,
            max_viewers: 64,
            stats_interval_secs: 30,
            producer_idle_secs: 30,
            secret: wire::DEFAULT_SECRET.to_string(),
            camera_addr: String::new(),
            camera_retry_ms: 5000,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            relay_host: "127.0.0.1".to_string(),
            relay_port: 0,
            transport: TransportKind::Stream,
            target_fps: 10.0,
            retry_delay_ms: 5000,
            max_fragment_payload: wire::DEFAULT_FRAGMENT_PAYLOAD,
            rehandshake_secs: 10,
            secret: wire::DEFAULT_SECRET.to_string(),
            source_dir: data_dir().join("frames"),
            listen_port: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_stream_buffer: wire::DEFAULT_MAX_STREAM_BUFFER,
            max_frame_len: wire::DEFAULT_MAX_FRAME_LEN,
            fragment_ttl_ms: wire::DEFAULT_FRAGMENT_TTL_MS,
            max_pending_frames: wire::DEFAULT_MAX_PENDING_FRAMES,
        }
    }
}

pub const DEFAULT_STREAM_PORT: u16 = 4444;
pub const DEFAULT_DATAGRAM_PORT: u16 = 8081;
pub const DEFAULT_VIEWER_PORT: u16 = 8080;
pub const DEFAULT_STATUS_PORT: u16 = 9090;

impl ProducerConfig {
    /// Port to dial, falling back to the relay default for the transport.
    pub fn effective_port(&self) -> u16 {
        match (self.relay_port, self.transport) {
            (0, TransportKind::Stream) => DEFAULT_STREAM_PORT,
            (0, TransportKind::Datagram) => DEFAULT_DATAGRAM_PORT,
            (port, _) => port,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("camrelay")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("camrelay")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CamrelayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CamrelayConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file, without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAMRELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CamrelayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAMRELAY_* overrides. `lookup` is `std::env::var` in production
    /// and a map in tests, so tests never touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &'static str, v: String) -> Result<T, ConfigError> {
            v.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key, v))
        }

        if let Some(v) = lookup("CAMRELAY_RELAY__INGEST_HOST") {
            self.relay.ingest_host = v;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__STREAM_PORT") {
            self.relay.stream_port = parsed("relay.stream_port", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__DATAGRAM_PORT") {
            self.relay.datagram_port = parsed("relay.datagram_port", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__VIEWER_HOST") {
            self.relay.viewer_host = v;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__VIEWER_PORT") {
            self.relay.viewer_port = parsed("relay.viewer_port", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__STATUS_PORT") {
            self.relay.status_port = parsed("relay.status_port", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__MAX_VIEWERS") {
            self.relay.max_viewers = parsed("relay.max_viewers", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__SECRET") {
            self.relay.secret = v;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__CAMERA_ADDR") {
            self.relay.camera_addr = v;
        }
        if let Some(v) = lookup("CAMRELAY_RELAY__CAMERA_RETRY_MS") {
            self.relay.camera_retry_ms = parsed("relay.camera_retry_ms", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__RELAY_HOST") {
            self.producer.relay_host = v;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__RELAY_PORT") {
            self.producer.relay_port = parsed("producer.relay_port", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__TRANSPORT") {
            self.producer.transport = v.parse()?;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__TARGET_FPS") {
            self.producer.target_fps = parsed("producer.target_fps", v)?;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__SECRET") {
            self.producer.secret = v;
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__SOURCE_DIR") {
            self.producer.source_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAMRELAY_PRODUCER__LISTEN_PORT") {
            self.producer.listen_port = parsed("producer.listen_port", v)?;
        }
        Ok(())
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = self.producer.max_fragment_payload;
        if p == 0 || p > wire::MAX_FRAGMENT_PAYLOAD {
            return Err(ConfigError::InvalidValue(
                "producer.max_fragment_payload",
                p.to_string(),
            ));
        }
        if self.limits.max_pending_frames == 0 {
            return Err(ConfigError::InvalidValue(
                "limits.max_pending_frames",
                "0".to_string(),
            ));
        }
        if self.limits.max_stream_buffer < 4 {
            return Err(ConfigError::InvalidValue(
                "limits.max_stream_buffer",
                self.limits.max_stream_buffer.to_string(),
            ));
        }
        if self.limits.max_frame_len > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(
                "limits.max_frame_len",
                self.limits.max_frame_len.to_string(),
            ));
        }
        if !self.producer.target_fps.is_finite() || self.producer.target_fps < 0.0 {
            return Err(ConfigError::InvalidValue(
                "producer.target_fps",
                self.producer.target_fps.to_string(),
            ));
        }
        if self.producer.listen_port != 0 && self.producer.transport != TransportKind::Stream {
            return Err(ConfigError::InvalidValue(
                "producer.transport",
                "serving a relay needs the stream transport".to_string(),
            ));
        }
        Ok(())
    }
}
