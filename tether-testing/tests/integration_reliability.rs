//! Delivery guarantees of reliable UDP through a misbehaving relay.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use tether_core::{FailPolicy, Protocol, SocketConfig, UdpConfig};
use tether_network::{ClientSocket, ServerSocket};
use tether_testing::{init_test_logging, Direction, FaultPlan, LossyRelay, RelayConditions};

fn fast_config() -> SocketConfig {
    let udp = UdpConfig::default()
        .with_connection_timeout(Duration::from_secs(5))
        .with_resend_interval(Duration::from_millis(100))
        .with_keepalive_interval(Duration::from_millis(50))
        .with_send_poll_interval(Duration::from_millis(20));
    SocketConfig::default().with_bind_host("127.0.0.1").with_udp(udp)
}

fn free_udp_port() -> u16 {
    loop {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        if port >= 1024 {
            return port;
        }
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Server that counts every delivered message.
async fn counting_server(config: SocketConfig) -> (ServerSocket, Arc<Mutex<HashMap<Vec<u8>, usize>>>, u16) {
    let mut server = ServerSocket::with_config(Protocol::Udp, config);
    let seen = Arc::new(Mutex::new(HashMap::new()));

    let sink = seen.clone();
    server.set_on_receive(move |_conn, data| {
        *sink.lock().entry(data.to_vec()).or_insert(0) += 1;
    });

    let port = free_udp_port();
    server.listen(port).await.unwrap();
    (server, seen, port)
}

fn upstream(port: u16) -> std::net::SocketAddr {
    std::net::SocketAddr::from(([127, 0, 0, 1], port))
}

/// Test that tracked packets all arrive exactly once despite heavy loss
#[tokio::test]
async fn test_resend_survives_loss() {
    init_test_logging();

    let (mut server, seen, port) = counting_server(fast_config()).await;
    let relay = LossyRelay::start(upstream(port), RelayConditions::lossy(0.3).with_seed(11))
        .await
        .unwrap();

    let mut client = ClientSocket::with_config(Protocol::Udp, fast_config());
    client.connect("127.0.0.1", relay.port()).await.unwrap();

    for i in 0..20 {
        let message = format!("message-{}", i).into_bytes();
        client.send_with_policy(message, FailPolicy::Resend, None).unwrap();
    }

    assert!(wait_until(|| seen.lock().len() == 20, Duration::from_secs(10)).await);
    assert!(seen.lock().values().all(|&count| count == 1));

    let conn = client.connection().upgrade().unwrap();
    assert!(wait_until(|| conn.unacked_packets() == 0, Duration::from_secs(10)).await);
    assert!(relay.stats().dropped > 0);

    client.close().await;
    server.close().await;
}

/// Test that duplicated datagrams are delivered once
#[tokio::test]
async fn test_duplicates_delivered_once() {
    init_test_logging();

    let (mut server, seen, port) = counting_server(fast_config()).await;
    let relay = LossyRelay::start(upstream(port), RelayConditions::default().with_duplicate_rate(1.0))
        .await
        .unwrap();

    let mut client = ClientSocket::with_config(Protocol::Udp, fast_config());
    client.connect("127.0.0.1", relay.port()).await.unwrap();

    for i in 0..5 {
        client
            .send_with_policy(format!("dup-{}", i).into_bytes(), FailPolicy::Resend, None)
            .unwrap();
    }

    assert!(wait_until(|| seen.lock().len() == 5, Duration::from_secs(5)).await);
    // give any stray copies time to arrive
    sleep(Duration::from_millis(300)).await;
    assert!(seen.lock().values().all(|&count| count == 1));
    assert!(relay.stats().duplicated >= 5);

    client.close().await;
    server.close().await;
}

/// Test that a dropped first transmission is recovered by resend, and a
/// dropped fire-and-forget packet is not
#[tokio::test]
async fn test_targeted_drops_by_policy() {
    init_test_logging();

    let (mut server, seen, port) = counting_server(fast_config()).await;
    let relay = LossyRelay::start(upstream(port), RelayConditions::default())
        .await
        .unwrap();
    relay.set_faults(
        FaultPlan::new()
            .drop_id(Direction::ToServer, 0, 1)
            .drop_id(Direction::ToServer, 1, 1),
    );

    // a long keepalive interval keeps ids 0 and 1 for the two sends below
    let udp = fast_config().udp.with_keepalive_interval(Duration::from_secs(1));
    let mut client = ClientSocket::with_config(Protocol::Udp, fast_config().with_udp(udp));
    client.connect("127.0.0.1", relay.port()).await.unwrap();

    client
        .send_with_policy(&b"tracked"[..], FailPolicy::Resend, None)
        .unwrap();
    client.send(&b"ignored"[..], None).unwrap();

    assert!(wait_until(|| seen.lock().contains_key(&b"tracked".to_vec()), Duration::from_secs(5)).await);
    sleep(Duration::from_millis(500)).await;
    assert!(!seen.lock().contains_key(&b"ignored".to_vec()));
    assert_eq!(seen.lock()[&b"tracked".to_vec()], 1);
    assert!(relay.stats().dropped >= 2);

    client.close().await;
    server.close().await;
}

/// Test that a partition times both sides out and each fires OnClose once
#[tokio::test]
async fn test_partition_times_out_both_sides() {
    init_test_logging();

    let udp = UdpConfig::default()
        .with_connection_timeout(Duration::from_millis(400))
        .with_resend_interval(Duration::from_millis(100))
        .with_keepalive_interval(Duration::from_millis(50))
        .with_send_poll_interval(Duration::from_millis(20));
    let config = SocketConfig::default().with_bind_host("127.0.0.1").with_udp(udp);

    let (mut server, seen, port) = counting_server(config.clone()).await;
    let server_closed = Arc::new(AtomicUsize::new(0));
    let counter = server_closed.clone();
    server.set_on_close(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let relay = LossyRelay::start(upstream(port), RelayConditions::default())
        .await
        .unwrap();

    let mut client = ClientSocket::with_config(Protocol::Udp, config);
    let client_closed = Arc::new(AtomicUsize::new(0));
    let counter = client_closed.clone();
    client.set_on_close(move |_conn| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    client.connect("127.0.0.1", relay.port()).await.unwrap();
    client.send(&b"hello"[..], None).unwrap();
    assert!(wait_until(|| seen.lock().len() == 1, Duration::from_secs(3)).await);
    // let server keepalives reach the client so its timeout clock is running
    sleep(Duration::from_millis(200)).await;

    relay.partition();
    assert!(wait_until(|| !client.is_connected(), Duration::from_secs(3)).await);
    assert!(wait_until(|| server.num_connections() == 0, Duration::from_secs(3)).await);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(client_closed.load(Ordering::SeqCst), 1);
    assert_eq!(server_closed.load(Ordering::SeqCst), 1);

    // after healing, a reconnect starts a fresh pseudo-connection
    relay.heal();
    client.reconnect().await.unwrap();
    client.send(&b"again"[..], None).unwrap();
    assert!(wait_until(|| seen.lock().len() == 2, Duration::from_secs(3)).await);
    assert_eq!(server.num_connections(), 1);

    client.close().await;
    server.close().await;
}
