//! End-to-end scenarios over real UDP sockets on localhost: both halves of the
//!  transport run against each other through the public API only.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hudp::{
    Channel, Delivery, EventObserver, HudpClient, HudpConfig, HudpServer, PacketDispatcher,
    SendError, TransportEvent,
};

struct Recorder {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder {
            deliveries: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    fn len(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    fn seqs(&self) -> Vec<u16> {
        self.recorded().iter().map(|d| d.seq.to_raw()).collect()
    }
}

#[async_trait]
impl PacketDispatcher for Recorder {
    async fn on_packet(&self, _from: SocketAddr, delivery: Delivery) {
        self.deliveries.lock().unwrap().push(delivery);
    }
}

struct EventRecorder {
    events: Mutex<Vec<TransportEvent>>,
}

impl EventRecorder {
    fn new() -> Arc<EventRecorder> {
        Arc::new(EventRecorder {
            events: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, predicate: impl Fn(&TransportEvent) -> bool) -> usize {
        self.recorded().iter().filter(|e| predicate(e)).count()
    }
}

impl EventObserver for EventRecorder {
    fn on_event(&self, event: &TransportEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

async fn wait_until(timeout: Duration, description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out after {:?} waiting until {}", timeout, description);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn localhost() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn indexed_payload(index: u32) -> Bytes {
    let mut payload = b"p".to_vec();
    payload.extend_from_slice(&index.to_le_bytes());
    Bytes::from(payload)
}

#[tokio::test]
async fn lossless_reliable_delivers_all_in_order() {
    let server_rx = Recorder::new();
    let server_events = EventRecorder::new();
    let server = HudpServer::bind(
        localhost(),
        server_rx.clone(),
        Some(server_events.clone() as Arc<dyn EventObserver>),
        HudpConfig::default(),
    )
    .await
    .unwrap();

    let client_events = EventRecorder::new();
    let client = HudpClient::connect(
        server.local_addr(),
        Recorder::new(),
        Some(client_events.clone() as Arc<dyn EventObserver>),
        HudpConfig::default(),
    )
    .await
    .unwrap();

    for i in 0u32..100 {
        client.send(indexed_payload(i), true).await.unwrap();
    }

    wait_until(Duration::from_secs(5), "all 100 payloads are delivered", || {
        server_rx.len() == 100
    })
    .await;

    let deliveries = server_rx.recorded();
    for (i, delivery) in deliveries.iter().enumerate() {
        assert_eq!(delivery.seq.to_raw(), i as u16);
        assert_eq!(delivery.channel, Channel::Reliable);
        assert!(!delivery.skipped);
        assert_eq!(delivery.payload, indexed_payload(i as u32));
    }

    // nothing was lost, so nothing may have been retransmitted
    assert_eq!(client.stats().retx_count, 0);

    // every arrival produced exactly one ACK, and every ACK found its packet
    wait_until(Duration::from_secs(5), "all 100 ACKs made it back", || {
        client_events.count(|e| matches!(e, TransportEvent::AckRx { .. })) == 100
    })
    .await;
    assert_eq!(server_events.count(|e| matches!(e, TransportEvent::AckTx { .. })), 100);

    // the in-flight table drained completely
    assert!(client.stats().rtt_mean_ms.is_some());
    assert_eq!(server.stats().skip_count, 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn lossless_unreliable_is_delivered_without_acks() {
    let server_rx = Recorder::new();
    let server_events = EventRecorder::new();
    let server = HudpServer::bind(
        localhost(),
        server_rx.clone(),
        Some(server_events.clone() as Arc<dyn EventObserver>),
        HudpConfig::default(),
    )
    .await
    .unwrap();

    let client = HudpClient::connect(
        server.local_addr(),
        Recorder::new(),
        None,
        HudpConfig::default(),
    )
    .await
    .unwrap();

    for i in 0u32..100 {
        client.send(indexed_payload(i), false).await.unwrap();
    }

    wait_until(Duration::from_secs(5), "all 100 unreliable payloads arrive on loopback", || {
        server_rx.len() == 100
    })
    .await;

    for delivery in server_rx.recorded() {
        assert_eq!(delivery.channel, Channel::Unreliable);
        assert_eq!(delivery.rtt_ms, None);
        assert!(!delivery.skipped);
    }

    let mut seqs = server_rx.seqs();
    seqs.sort_unstable();
    assert_eq!(seqs, (0u16..100).collect::<Vec<_>>());

    assert_eq!(server_events.count(|e| matches!(e, TransportEvent::AckTx { .. })), 0);
    assert_eq!(client.stats().retx_count, 0);
    assert_eq!(client.stats().tx_unreliable, 100);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn moderate_loss_still_delivers_everything() {
    let server_rx = Recorder::new();
    let server = HudpServer::bind(
        localhost(),
        server_rx.clone(),
        None,
        HudpConfig::default(),
    )
    .await
    .unwrap();

    // 10% egress loss on the client; short timeout keeps the test quick
    let client_config = HudpConfig {
        loss_prob: 0.10,
        retx_timeout: Duration::from_millis(40),
        ..HudpConfig::default()
    };
    let client = HudpClient::connect(server.local_addr(), Recorder::new(), None, client_config)
        .await
        .unwrap();

    for i in 0u32..200 {
        client.send(indexed_payload(i), true).await.unwrap();
    }

    wait_until(Duration::from_secs(20), "all 200 payloads survive the loss", || {
        server_rx.len() == 200
    })
    .await;

    // every sequence delivered exactly once - at-most-once held under loss
    let mut seqs = server_rx.seqs();
    seqs.sort_unstable();
    assert_eq!(seqs, (0u16..200).collect::<Vec<_>>());

    // with 10% loss over 200 packets some retransmission is certain
    assert!(client.stats().retx_count >= 1);

    // retransmissions beat the gap timeout comfortably, so skips stay rare
    assert!(server.stats().skip_count <= 2, "skip_count was {}", server.stats().skip_count);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn window_backpressure_gates_concurrent_senders() {
    // the server drops all of its egress, so no ACK ever reaches the client
    let server_rx = Recorder::new();
    let server_config = HudpConfig {
        loss_prob: 1.0,
        ..HudpConfig::default()
    };
    let server = HudpServer::bind(localhost(), server_rx.clone(), None, server_config)
        .await
        .unwrap();

    let client_config = HudpConfig {
        send_window_size: 4,
        retx_timeout: Duration::from_millis(50),
        max_retx: 2,
        ..HudpConfig::default()
    };
    let client = Arc::new(
        HudpClient::connect(server.local_addr(), Recorder::new(), None, client_config)
            .await
            .unwrap(),
    );

    let completed = Arc::new(Mutex::new(Vec::<u32>::new()));
    let mut handles = Vec::new();
    for i in 0u32..10 {
        let client = client.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            client.send(indexed_payload(i), true).await.unwrap();
            completed.lock().unwrap().push(i);
        }));
    }

    // only a window's worth of sends is admitted while ACKs are starved
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.stats().tx_reliable, 4);
    assert_eq!(completed.lock().unwrap().len(), 4);

    // retransmission budgets expire, slots free up, the rest gets through
    for handle in handles {
        handle.await.unwrap();
    }
    wait_until(Duration::from_secs(5), "every sequence is dropped after its budget", || {
        client.stats().drop_count == 10
    })
    .await;
    assert_eq!(client.stats().tx_reliable, 10);

    // the data itself arrived (only the ACKs were starved), each seq only once
    let mut seqs = server_rx.seqs();
    seqs.sort_unstable();
    assert_eq!(seqs, (0u16..10).collect::<Vec<_>>());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let server = HudpServer::bind(localhost(), Recorder::new(), None, HudpConfig::default())
        .await
        .unwrap();
    let client = HudpClient::connect(
        server.local_addr(),
        Recorder::new(),
        None,
        HudpConfig::default(),
    )
    .await
    .unwrap();

    // 1193 + 8 > 1200; one byte less fits
    let too_large = Bytes::from(vec![0u8; 1193]);
    assert!(matches!(
        client.send(too_large.clone(), true).await,
        Err(SendError::PayloadTooLarge { payload_len: 1193, mtu: 1200 })
    ));
    assert!(matches!(
        client.send(too_large, false).await,
        Err(SendError::PayloadTooLarge { .. })
    ));
    client.send(Bytes::from(vec![0u8; 1192]), true).await.unwrap();

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn close_fails_pending_and_subsequent_sends() {
    let server = HudpServer::bind(localhost(), Recorder::new(), None, HudpConfig::default())
        .await
        .unwrap();

    let client_config = HudpConfig {
        send_window_size: 1,
        ..HudpConfig::default()
    };
    // the server is closed right away, so nothing will ever ACK
    let server_addr = server.local_addr();
    server.close().await;

    let client = Arc::new(
        HudpClient::connect(server_addr, Recorder::new(), None, client_config)
            .await
            .unwrap(),
    );

    client.send(Bytes::from_static(b"first"), true).await.unwrap();
    let blocked = {
        let client = client.clone();
        tokio::spawn(async move { client.send(Bytes::from_static(b"second"), true).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await;
    assert_eq!(blocked.await.unwrap(), Err(SendError::Closed));
    assert_eq!(
        client.send(Bytes::from_static(b"third"), true).await,
        Err(SendError::Closed)
    );
}

#[tokio::test]
async fn both_channels_share_one_socket() {
    let server_rx = Recorder::new();
    let server = HudpServer::bind(localhost(), server_rx.clone(), None, HudpConfig::default())
        .await
        .unwrap();
    let client = HudpClient::connect(
        server.local_addr(),
        Recorder::new(),
        None,
        HudpConfig::default(),
    )
    .await
    .unwrap();

    for i in 0u32..20 {
        client.send(indexed_payload(i), i % 2 == 0).await.unwrap();
    }

    wait_until(Duration::from_secs(5), "both channels delivered", || {
        server_rx.len() == 20
    })
    .await;

    let deliveries = server_rx.recorded();
    let reliable = deliveries.iter().filter(|d| d.channel == Channel::Reliable).count();
    let unreliable = deliveries.iter().filter(|d| d.channel == Channel::Unreliable).count();
    assert_eq!(reliable, 10);
    assert_eq!(unreliable, 10);

    // the sequence spaces are independent: both count 0..10
    let mut reliable_seqs = deliveries
        .iter()
        .filter(|d| d.channel == Channel::Reliable)
        .map(|d| d.seq.to_raw())
        .collect::<Vec<_>>();
    reliable_seqs.sort_unstable();
    assert_eq!(reliable_seqs, (0u16..10).collect::<Vec<_>>());

    let mut unreliable_seqs = deliveries
        .iter()
        .filter(|d| d.channel == Channel::Unreliable)
        .map(|d| d.seq.to_raw())
        .collect::<Vec<_>>();
    unreliable_seqs.sort_unstable();
    assert_eq!(unreliable_seqs, (0u16..10).collect::<Vec<_>>());

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn server_sends_reliably_to_client() {
    // the per-peer engine pair is symmetric: the server's send side runs the
    //  same ARQ against the client's receive side
    let server_rx = Recorder::new();
    let server = HudpServer::bind(localhost(), server_rx.clone(), None, HudpConfig::default())
        .await
        .unwrap();

    let client_rx = Recorder::new();
    let client = HudpClient::connect(
        server.local_addr(),
        client_rx.clone(),
        None,
        HudpConfig::default(),
    )
    .await
    .unwrap();

    // the server learns the client's address from its first packet
    client.send(Bytes::from_static(b"hello"), true).await.unwrap();
    wait_until(Duration::from_secs(5), "server saw the client", || server_rx.len() == 1).await;
    let client_addr = client.local_addr();
    let peer_addr = SocketAddr::from(([127, 0, 0, 1], client_addr.port()));

    for i in 0u32..50 {
        server.send_to(peer_addr, indexed_payload(i), true).await.unwrap();
    }

    wait_until(Duration::from_secs(5), "client received all 50", || {
        client_rx.len() == 50
    })
    .await;

    let seqs = client_rx.seqs();
    assert_eq!(seqs, (0u16..50).collect::<Vec<_>>());
    assert!(client_rx.recorded().iter().all(|d| !d.skipped));

    client.close().await;
    server.close().await;
}
