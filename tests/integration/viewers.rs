//! Viewer fan-out: every viewer gets the newest frame, none blocks another.

use crate::*;

use std::time::Duration;

async fn producer(relay: &TestRelay) -> TcpStream {
    TcpStream::connect(relay.addrs.stream).await.unwrap()
}

#[tokio::test]
async fn every_viewer_gets_each_frame() {
    let relay = start_relay().await.unwrap();
    let mut a = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    let mut b = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 2).await.unwrap();

    let mut p = producer(&relay).await;
    for id in 1..=3 {
        p.write_all(&test_frame(id, 512)).await.unwrap();
        assert_eq!(frame_id(&a.frame_with_id(id).await.unwrap()), id);
        assert_eq!(frame_id(&b.frame_with_id(id).await.unwrap()), id);
    }
}

#[tokio::test]
async fn late_viewer_starts_with_latest_frame() {
    let relay = start_relay().await.unwrap();
    let mut p = producer(&relay).await;
    p.write_all(&test_frame(1, 256)).await.unwrap();
    p.write_all(&test_frame(2, 256)).await.unwrap();

    for _ in 0..300 {
        if relay.mux.latest().is_some_and(|f| frame_id(f.payload()) == 2) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut late = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    let first = late.next_frame().await.unwrap();
    assert_eq!(frame_id(&first), 2);
}

#[tokio::test]
async fn stalled_viewer_does_not_hold_back_others() {
    let relay = start_relay().await.unwrap();

    // Connected but never reads.
    let _stalled = TcpStream::connect(relay.addrs.viewers).await.unwrap();
    let mut live = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 2).await.unwrap();

    // Enough data to fill the stalled viewer's socket buffers several times.
    let mut p = producer(&relay).await;
    for id in 1..=40 {
        p.write_all(&test_frame(id, 256 * 1024)).await.unwrap();
        live.frame_with_id(id).await.unwrap();
    }
}

#[tokio::test]
async fn slow_viewer_skips_to_newest_frame() {
    let relay = start_relay().await.unwrap();
    let mut viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();

    let mut p = producer(&relay).await;
    for id in 1..=50 {
        p.write_all(&test_frame(id, 64 * 1024)).await.unwrap();
    }

    // Frames in between may be dropped, but order never regresses and the
    // newest frame always arrives.
    let mut last = 0;
    loop {
        let id = frame_id(&viewer.next_frame().await.unwrap());
        assert!(id > last, "frame {id} after {last}");
        last = id;
        if id == 50 {
            break;
        }
    }
}

#[tokio::test]
async fn viewers_over_limit_are_refused() {
    let mut config = test_config();
    config.relay.max_viewers = 2;
    let relay = start_relay_with(config).await.unwrap();

    let _a = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    let _b = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 2).await.unwrap();

    let mut refused = TcpStream::connect(relay.addrs.viewers).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(WAIT, refused.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(relay.mux.consumer_count(), 2);
    assert_eq!(relay.stats.snapshot().viewers_refused, 1);
}

#[tokio::test]
async fn disconnected_viewer_frees_its_slot() {
    let mut config = test_config();
    config.relay.max_viewers = 1;
    let relay = start_relay_with(config).await.unwrap();

    let first = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();
    drop(first);
    wait_for_viewers(&relay.mux, 0).await.unwrap();

    let mut second = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();
    let mut p = producer(&relay).await;
    p.write_all(&test_frame(7, 128)).await.unwrap();
    assert_eq!(frame_id(&second.next_frame().await.unwrap()), 7);
}
