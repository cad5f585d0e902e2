//! camrelayd — camera frame relay daemon.

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};

use camrelay_core::config::CamrelayConfig;
use camrelayd::{status, Relay};

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
    let status_port = config.relay.status_port;
    let camera_addr = config.relay.camera_addr.clone();

    let relay = Relay::bind(config).await?;
    let addrs = relay.local_addrs()?;
    let camera = if camera_addr.is_empty() { "none" } else { camera_addr.as_str() };
    tracing::info!(
        stream = %addrs.stream,
        datagram = %addrs.datagram.map(|a| a.to_string()).unwrap_or_else(|| "disabled".into()),
        viewers = %addrs.viewers,
        camera,
        "camrelayd starting"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // ── Status endpoint ──────────────────────────────────────────────────────

    if status_port != 0 {
        let state = relay.status_state();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, status_port, shutdown).await {
                tracing::warn!(error = %e, "status endpoint failed");
            }
        });
    }

    let tasks = relay.spawn(&shutdown_tx);

    // ── Ctrl-C ───────────────────────────────────────────────────────────────

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = shutdown_tx.send(());
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let datagram_task = optional(tasks.datagram);
    let pull_task = optional(tasks.pull);

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = tasks.stream       => tracing::error!("stream ingest exited: {:?}", r),
        r = datagram_task      => tracing::error!("datagram ingest exited: {:?}", r),
        r = pull_task          => tracing::error!("pull ingest exited: {:?}", r),
        r = tasks.viewers      => tracing::error!("viewer server exited: {:?}", r),
    }

    // Give tasks a moment to observe shutdown.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    if let Some(printer) = tasks.stats_printer {
        printer.abort();
    }
    Ok(())
}

/// A task that may not exist. Absent tasks never finish.
async fn optional<T>(task: Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
