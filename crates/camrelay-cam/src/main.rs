//! camrelay-cam — camera daemon. Captures frames and streams them to the relay.
//!
//! Usage: camrelay-cam [FRAME_DIR]
//!
//! FRAME_DIR overrides `producer.source_dir`. Without a usable directory the
//! daemon sends synthetic frames, which is enough to exercise a relay.
//!
//! With `producer.listen_port` set the daemon dials nobody. It serves the
//! stream transport on that port and a relay configured with
//! `relay.camera_addr` dials in.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use camrelay_core::config::CamrelayConfig;
use camrelay_services::{FrameSource, ProducerSettings, Supervisor};

mod source;

use source::{DirectorySource, SyntheticSource};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CamrelayConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CamrelayConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CamrelayConfig::default()
    });

    let source_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.producer.source_dir.clone());

    let settings = ProducerSettings::from_config(&config.producer);
    let listener = match config.producer.listen_port {
        0 => None,
        port => Some(
            TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("failed to bind camera listener on port {port}"))?,
        ),
    };
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    match DirectorySource::open(&source_dir) {
        Ok(source) => {
            tracing::info!(dir = %source_dir.display(), frames = source.len(), "using frame directory");
            run(settings, source, listener, shutdown_rx).await
        }
        Err(e) => {
            tracing::warn!(error = %e, "no frame directory, sending synthetic frames");
            run(settings, SyntheticSource::default(), listener, shutdown_rx).await
        }
    }
}

async fn run<S: FrameSource>(
    settings: ProducerSettings,
    source: S,
    listener: Option<TcpListener>,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let sup = match listener {
        Some(listener) => Supervisor::serving(settings, source, listener),
        None => Supervisor::new(settings, source),
    };
    sup.run(shutdown).await
}
