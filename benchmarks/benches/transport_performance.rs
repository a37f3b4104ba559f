use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Notify;

use tether_core::{FailPolicy, Protocol, SocketConfig};
use tether_network::{ClientSocket, ServerSocket};

const BATCH: usize = 50;

fn newline_validator(buf: &[u8]) -> usize {
    buf.iter().position(|&b| b == b'\n').map_or(0, |pos| pos + 1)
}

fn free_port(protocol: Protocol) -> u16 {
    loop {
        let port = match protocol {
            Protocol::Tcp => std::net::TcpListener::bind("127.0.0.1:0")
                .and_then(|l| l.local_addr())
                .map(|a| a.port()),
            Protocol::Udp => std::net::UdpSocket::bind("127.0.0.1:0")
                .and_then(|s| s.local_addr())
                .map(|a| a.port()),
        }
        .expect("loopback socket");
        if port >= 1024 {
            return port;
        }
    }
}

struct EchoPair {
    server: ServerSocket,
    client: ClientSocket,
    replies: Arc<AtomicUsize>,
    arrived: Arc<Notify>,
}

impl EchoPair {
    async fn start(protocol: Protocol) -> Self {
        let config = SocketConfig::default().with_bind_host("127.0.0.1");

        let mut server = ServerSocket::with_config(protocol, config.clone());
        server.set_packet_validator(newline_validator);
        server.set_on_receive(|conn, data| {
            let _ = conn.send_with_policy(data.to_vec(), FailPolicy::Resend, None);
        });
        let port = free_port(protocol);
        server.listen(port).await.expect("listen");

        let replies = Arc::new(AtomicUsize::new(0));
        let arrived = Arc::new(Notify::new());
        let mut client = ClientSocket::with_config(protocol, config);
        client.set_packet_validator(newline_validator);
        let (counter, notify) = (replies.clone(), arrived.clone());
        client.set_on_receive(move |_conn, _data| {
            counter.fetch_add(1, Ordering::SeqCst);
            notify.notify_one();
        });
        client.connect("127.0.0.1", port).await.expect("connect");

        Self {
            server,
            client,
            replies,
            arrived,
        }
    }

    /// Send a batch of lines and wait until every echo is back.
    async fn round_trip(&self, line: &[u8]) {
        let target = self.replies.load(Ordering::SeqCst) + BATCH;
        for _ in 0..BATCH {
            self.client
                .send_with_policy(line.to_vec(), FailPolicy::Resend, None)
                .expect("send");
        }
        while self.replies.load(Ordering::SeqCst) < target {
            let _ = tokio::time::timeout(Duration::from_millis(50), self.arrived.notified()).await;
        }
    }

    async fn stop(mut self) {
        self.client.close().await;
        self.server.close().await;
    }
}

fn benchmark_echo(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("echo_round_trip");
    group.sample_size(20);

    for protocol in [Protocol::Tcp, Protocol::Udp] {
        let pair = rt.block_on(EchoPair::start(protocol));

        for size in [32usize, 1024] {
            let mut line = vec![b'a'; size - 1];
            line.push(b'\n');
            group.throughput(Throughput::Bytes((size * BATCH) as u64));
            group.bench_with_input(BenchmarkId::new(protocol.to_string(), size), &line, |b, line| {
                b.iter(|| rt.block_on(pair.round_trip(line)))
            });
        }

        rt.block_on(pair.stop());
    }

    group.finish();
}

criterion_group!(benches, benchmark_echo);
criterion_main!(benches);
