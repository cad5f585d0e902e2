//! Producer supervisor against a live relay, over both transports.

use crate::*;

use std::time::Duration;

use camrelay_core::config::TransportKind;
use camrelay_core::wire::secret_from_str;
use camrelay_services::{ProducerSettings, Supervisor};

fn settings(relay: &TestRelay, transport: TransportKind) -> ProducerSettings {
    let port = match transport {
        TransportKind::Stream => relay.addrs.stream.port(),
        TransportKind::Datagram => relay.addrs.datagram.unwrap().port(),
    };
    ProducerSettings {
        host: "127.0.0.1".to_string(),
        port,
        transport,
        target_fps: 50.0,
        retry_delay: Duration::from_millis(100),
        secret: secret_from_str(SECRET),
        stats_interval: None,
        ..ProducerSettings::default()
    }
}

fn spawn_producer(settings: ProducerSettings, len: usize) -> broadcast::Sender<()> {
    let (tx, rx) = broadcast::channel(1);
    let sup = Supervisor::new(settings, Counter::new(len));
    tokio::spawn(sup.run(rx));
    tx
}

#[tokio::test]
async fn stream_producer_feeds_viewers() {
    let relay = start_relay().await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();

    let _stop = spawn_producer(settings(&relay, TransportKind::Stream), 30_000);
    expect_progress(&mut viewer, 10).await;
    assert!(relay.stats.snapshot().stream_frames >= 10);
}

#[tokio::test]
async fn datagram_producer_feeds_viewers() {
    let relay = start_relay().await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();

    let _stop = spawn_producer(settings(&relay, TransportKind::Datagram), 30_000);
    expect_progress(&mut viewer, 10).await;
    let stats = relay.stats.snapshot();
    assert!(stats.datagram_frames >= 10);
    assert_eq!(stats.handshakes, 1);
}

#[tokio::test]
async fn producer_reconnects_after_relay_restart() {
    let first = start_relay().await.unwrap();
    let config = {
        let mut c = first.config.clone();
        c.relay.stream_port = first.addrs.stream.port();
        c
    };
    let _stop = spawn_producer(settings(&first, TransportKind::Stream), 1_000);

    let mut viewer = ViewerClient::connect(first.addrs.viewers).await.unwrap();
    expect_progress(&mut viewer, 3).await;

    // Stop the relay and bring it back on the same ingest port.
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut second = None;
    for _ in 0..50 {
        match start_relay_with(config.clone()).await {
            Ok(relay) => {
                second = Some(relay);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let second = second.expect("relay did not rebind its port");

    let mut viewer = ViewerClient::connect(second.addrs.viewers).await.unwrap();
    expect_progress(&mut viewer, 3).await;
    assert_eq!(second.stats.snapshot().producer_sessions, 1);
}

#[tokio::test]
async fn producer_waits_for_relay_to_appear() {
    let port = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    };
    let mut config = test_config();
    config.relay.stream_port = port;

    let settings = ProducerSettings {
        host: "127.0.0.1".to_string(),
        port,
        transport: TransportKind::Stream,
        target_fps: 50.0,
        retry_delay: Duration::from_millis(100),
        stats_interval: None,
        ..ProducerSettings::default()
    };
    let _stop = spawn_producer(settings, 1_000);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let relay = start_relay_with(config).await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    expect_progress(&mut viewer, 3).await;
}
