//! Pull mode: the camera serves the stream transport and the relay dials it.

use crate::*;

use std::time::Duration;

use tokio::net::TcpListener;

use camrelay_services::{ProducerSettings, Supervisor};

/// A camera serving `Counter` frames on a loopback port.
async fn serving_camera(frame_len: usize) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let settings = ProducerSettings {
        target_fps: 50.0,
        retry_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(100),
        stats_interval: None,
        ..ProducerSettings::default()
    };
    let (tx, rx) = broadcast::channel(1);
    let sup = Supervisor::serving(settings, Counter::new(frame_len), listener);
    tokio::spawn(sup.run(rx));
    (addr, tx)
}

fn pull_config(camera: SocketAddr) -> CamrelayConfig {
    let mut config = test_config();
    config.relay.camera_addr = camera.to_string();
    config.relay.camera_retry_ms = 100;
    config
}

#[tokio::test]
async fn relay_pulls_from_serving_camera() {
    let (camera, _stop) = serving_camera(20_000).await;
    let relay = start_relay_with(pull_config(camera)).await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();

    expect_progress(&mut viewer, 5).await;
    let stats = relay.stats.snapshot();
    assert!(stats.stream_frames >= 5);
    assert_eq!(stats.producer_sessions, 1);
    assert_eq!(stats.stream_bytes_discarded, 0);
}

#[tokio::test]
async fn relay_redials_a_restarted_camera() {
    let (camera, stop) = serving_camera(4_000).await;
    let relay = start_relay_with(pull_config(camera)).await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    expect_progress(&mut viewer, 3).await;

    // Stop the camera and bring a new one up on the same port.
    stop.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut listener = None;
    for _ in 0..50 {
        match TcpListener::bind(camera).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let listener = listener.expect("camera port did not come free");
    let settings = ProducerSettings {
        target_fps: 50.0,
        connect_timeout: Duration::from_millis(100),
        stats_interval: None,
        ..ProducerSettings::default()
    };
    let (_tx, rx) = broadcast::channel(1);
    tokio::spawn(Supervisor::serving(settings, Counter::new(4_000), listener).run(rx));

    // The new camera counts from 1 again.
    let mut restarted = false;
    for _ in 0..100 {
        if frame_id(&viewer.next_frame().await.unwrap()) == 1 {
            restarted = true;
            break;
        }
    }
    assert!(restarted, "never saw the restarted camera's first frame");
    assert_eq!(relay.stats.snapshot().producer_sessions, 2);
}

#[tokio::test]
async fn pushed_producer_still_accepted_in_pull_mode() {
    // Nothing listens at the camera address; the relay keeps redialing.
    let camera: SocketAddr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let relay = start_relay_with(pull_config(camera)).await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();

    let mut producer = TcpStream::connect(relay.addrs.stream).await.unwrap();
    producer.write_all(&test_frame(9, 256)).await.unwrap();
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 9);
}
