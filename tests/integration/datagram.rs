//! Datagram transport: handshake, fragmentation and reassembly over UDP.

use crate::*;

use std::time::Duration;

use tokio::net::UdpSocket;
use zerocopy::AsBytes;

use camrelay_core::wire::{secret_from_str, Handshake};
use camrelay_services::framer::fragment;

/// Raw UDP producer that sends exactly the datagrams a test asks for.
struct UdpProducer {
    socket: UdpSocket,
}

impl UdpProducer {
    async fn connect(relay: &TestRelay) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(relay.addrs.datagram.unwrap()).await.unwrap();
        Self { socket }
    }

    async fn handshake(&self, secret: &str) {
        let hs = Handshake::new(secret_from_str(secret));
        self.socket.send(hs.as_bytes()).await.unwrap();
    }

    async fn send_all(&self, fragments: &[Bytes]) {
        for f in fragments {
            self.socket.send(f).await.unwrap();
        }
    }

    async fn send_frame(&self, seq: u32, frame: &[u8]) {
        self.send_all(&fragment(seq, frame, 1400).unwrap()).await;
    }
}

async fn relay_and_viewer(config: CamrelayConfig) -> (TestRelay, ViewerClient) {
    let relay = start_relay_with(config).await.unwrap();
    let viewer = ViewerClient::connect(relay.addrs.viewers).await.unwrap();
    wait_for_viewers(&relay.mux, 1).await.unwrap();
    (relay, viewer)
}

#[tokio::test]
async fn fragmented_frame_reaches_viewer() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;

    let frame = test_frame(1, 10_000);
    producer.send_frame(0, &frame).await;

    let got = viewer.next_frame().await.unwrap();
    assert_eq!(&got[..], &frame[..]);
    assert_eq!(relay.stats.snapshot().handshakes, 1);
}

#[tokio::test]
async fn out_of_order_fragments_are_reassembled() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;

    let frame = test_frame(3, 6_000);
    let mut fragments = fragment(0, &frame, 1000).unwrap();
    fragments.reverse();
    fragments.swap(1, 3);
    producer.send_all(&fragments).await;

    let got = viewer.next_frame().await.unwrap();
    assert_eq!(&got[..], &frame[..]);
}

#[tokio::test]
async fn incomplete_frame_is_never_delivered() {
    let mut config = test_config();
    config.limits.fragment_ttl_ms = 100;
    let (relay, mut viewer) = relay_and_viewer(config).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;

    let mut fragments = fragment(0, &test_frame(1, 5_000), 1000).unwrap();
    fragments.remove(2);
    producer.send_all(&fragments).await;

    assert!(viewer.stays_quiet(Duration::from_millis(400)).await);
    assert!(relay.stats.snapshot().expired_sets >= 1);

    // The next whole frame still goes through.
    producer.send_frame(1, &test_frame(2, 5_000)).await;
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 2);
}

#[tokio::test]
async fn newer_frame_supersedes_incomplete_one() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;

    let mut partial = fragment(0, &test_frame(1, 5_000), 1000).unwrap();
    partial.pop();
    producer.send_all(&partial).await;
    producer.send_frame(1, &test_frame(2, 5_000)).await;

    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.stats.snapshot().evicted_sets, 1);
    assert_eq!(relay.stats.snapshot().datagram_frames, 1);
}

#[tokio::test]
async fn rehandshake_resets_sequence() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;
    producer.send_frame(500, &test_frame(1, 2_000)).await;
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 1);

    // Without a handshake a restarted sequence counts as stale.
    producer.send_frame(0, &test_frame(2, 2_000)).await;
    assert!(viewer.stays_quiet(Duration::from_millis(200)).await);

    producer.handshake(SECRET).await;
    producer.send_frame(0, &test_frame(3, 2_000)).await;
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 3);
    assert_eq!(relay.stats.snapshot().handshakes, 2);
}

#[tokio::test]
async fn wrong_secret_is_ignored() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake("WRONGKEY").await;
    producer.send_frame(0, &test_frame(1, 2_000)).await;

    assert!(viewer.stays_quiet(Duration::from_millis(300)).await);
    let stats = relay.stats.snapshot();
    assert_eq!(stats.handshakes, 0);
    assert!(stats.datagrams_dropped >= 2);
    assert!(stats.datagram_producer.is_none());
}

#[tokio::test]
async fn new_producer_takes_over_after_handshake() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let first = UdpProducer::connect(&relay).await;
    first.handshake(SECRET).await;
    first.send_frame(0, &test_frame(1, 2_000)).await;
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 1);

    let second = UdpProducer::connect(&relay).await;
    second.handshake(SECRET).await;
    second.send_frame(0, &test_frame(2, 2_000)).await;
    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 2);

    // The replaced producer no longer reaches viewers.
    first.send_frame(1, &test_frame(3, 2_000)).await;
    assert!(viewer.stays_quiet(Duration::from_millis(200)).await);

    let stats = relay.stats.snapshot();
    assert_eq!(stats.producer_sessions, 2);
    let expected = second.socket.local_addr().unwrap().to_string();
    assert_eq!(stats.datagram_producer.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn malformed_datagrams_are_dropped() {
    let (relay, mut viewer) = relay_and_viewer(test_config()).await;
    let producer = UdpProducer::connect(&relay).await;
    producer.handshake(SECRET).await;
    producer.socket.send(&[0x01, 0x02, 0x03]).await.unwrap();
    producer.send_frame(0, &test_frame(1, 2_000)).await;

    assert_eq!(frame_id(&viewer.next_frame().await.unwrap()), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.stats.snapshot().datagrams_dropped, 1);
}
