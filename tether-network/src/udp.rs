//! Reliable-datagram transport.
//!
//! Every datagram carries a [`DatagramHeader`]. Packets sent with a tracked
//! [`FailPolicy`] stay in the outstanding table until the peer acknowledges
//! them, and are queued again every resend interval until then. Server-side
//! connections share the listening socket and are told apart by peer address.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use tether_core::header::DatagramHeader;
use tether_core::reliability::{AckTracker, OutgoingPacket, OutstandingTable, Receipt};
use tether_core::{ConnectionId, FailPolicy, PeerAddr, Result, SendCallback, TetherError, UdpConfig};

use crate::connection::RecvOutcome;

struct QueuedPacket {
    packet: OutgoingPacket,
    on_sent: Option<SendCallback>,
}

struct Timing {
    last_received: Option<Instant>,
    last_sent: Instant,
}

pub(crate) struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Client sockets are `connect`ed and send without a destination
    connected: bool,
    config: UdpConfig,
    peer: Mutex<Option<PeerAddr>>,
    next_id: AtomicI32,
    queue: Mutex<BTreeMap<i32, QueuedPacket>>,
    tracker: Mutex<AckTracker>,
    outstanding: Mutex<OutstandingTable>,
    timing: Mutex<Timing>,
    closing: AtomicBool,
}

impl UdpTransport {
    /// Server-side pseudo-connection over the shared listening socket. The
    /// peer is adopted from the first datagram offered to it; the timeout
    /// clock starts now, whether or not that datagram parses.
    pub fn accepted(socket: Arc<UdpSocket>, config: UdpConfig) -> Self {
        Self::build(socket, false, None, Some(Instant::now()), config)
    }

    /// Client connection on its own `connect`ed socket. It cannot time out
    /// before the first datagram from the server arrives.
    pub fn connected(socket: Arc<UdpSocket>, peer: PeerAddr, config: UdpConfig) -> Self {
        Self::build(socket, true, Some(peer), None, config)
    }

    fn build(
        socket: Arc<UdpSocket>,
        connected: bool,
        peer: Option<PeerAddr>,
        last_received: Option<Instant>,
        config: UdpConfig,
    ) -> Self {
        Self {
            socket,
            connected,
            config,
            peer: Mutex::new(peer),
            next_id: AtomicI32::new(0),
            queue: Mutex::new(BTreeMap::new()),
            tracker: Mutex::new(AckTracker::new()),
            outstanding: Mutex::new(OutstandingTable::new()),
            timing: Mutex::new(Timing {
                last_received,
                last_sent: Instant::now(),
            }),
            closing: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> Option<PeerAddr> {
        *self.peer.lock()
    }

    pub fn unacked(&self) -> usize {
        self.outstanding.lock().len()
    }

    pub fn request_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Bind a peerless connection to `sender` ahead of its first read.
    pub fn adopt(&self, sender: SocketAddr) {
        let mut peer = self.peer.lock();
        if peer.is_none() {
            *peer = Some(PeerAddr::from(sender));
        }
    }

    /// Allocate the next id and queue the datagram. Returns the id.
    pub fn enqueue(&self, payload: Bytes, policy: FailPolicy, on_sent: Option<SendCallback>) -> Result<i32> {
        let id = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| TetherError::SequenceExhausted)?;

        let header = self.tracker.lock().header_for(id);
        let packet = OutgoingPacket::new(header, policy, payload);
        self.queue.lock().insert(id, QueuedPacket { packet, on_sent });
        Ok(id)
    }

    /// Take the queue in id order and record tracked packets as outstanding,
    /// so an ack that arrives while they are being written still releases
    /// them. Empty while the peer is unknown.
    fn stage(&self) -> Vec<(i32, Bytes, Option<SendCallback>)> {
        if self.peer.lock().is_none() {
            return Vec::new();
        }

        let pending = std::mem::take(&mut *self.queue.lock());
        let now = Instant::now();
        let mut outstanding = self.outstanding.lock();
        pending
            .into_iter()
            .map(|(id, QueuedPacket { packet, on_sent })| {
                let datagram = packet.datagram();
                outstanding.record(packet, now);
                (id, datagram, on_sent)
            })
            .collect()
    }

    /// Send every queued datagram in id order. Nothing is sent before the
    /// peer is known.
    pub async fn flush(&self, conn: ConnectionId) {
        let staged = self.stage();
        if staged.is_empty() {
            return;
        }
        let Some(peer) = self.peer() else {
            return;
        };

        for (id, datagram, on_sent) in staged {
            let result = if self.connected {
                self.socket.send(&datagram).await
            } else {
                self.socket.send_to(&datagram, peer.socket_addr()).await
            };

            match result {
                Ok(sent) => trace!("{} sent datagram {} ({} bytes) to {}", conn, id, sent, peer),
                Err(e) => warn!("{} failed to send datagram {} to {}: {}", conn, id, peer, e),
            }
            if let Some(on_sent) = on_sent {
                on_sent();
            }
        }

        self.timing.lock().last_sent = Instant::now();
    }

    /// Whether `sender` is this connection's peer, adopting it if none is
    /// known yet.
    fn claims(&self, conn: ConnectionId, sender: SocketAddr) -> bool {
        let mut peer = self.peer.lock();
        let known = *peer;
        match known {
            None => {
                debug!("{} adopted peer {}", conn, sender);
                *peer = Some(PeerAddr::from(sender));
                true
            }
            Some(known) => known.matches(&sender),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.socket.readable().await
    }

    pub fn recv<F>(&self, conn: ConnectionId, scratch: &mut [u8], deliver: F) -> RecvOutcome
    where
        F: FnOnce(&[u8]),
    {
        let peeked = match self.socket.try_peek_sender() {
            Ok(sender) => {
                if !self.claims(conn, sender) {
                    return RecvOutcome::NotForThisConnection;
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return RecvOutcome::Pending,
            // the read below reports the same failure
            Err(e) => {
                debug!("{} could not peek sender: {}", conn, e);
                false
            }
        };

        let (len, from) = match self.socket.try_recv_from(scratch) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return RecvOutcome::Pending,
            Err(e) => {
                warn!("{} receive failed: {}", conn, e);
                return RecvOutcome::Failed;
            }
        };

        // without a peek the datagram is only checked once consumed; a
        // stranger's datagram cannot be handed back, so it is dropped
        if !peeked && !self.claims(conn, from) {
            debug!("{} dropping datagram from {}, not its peer", conn, from);
            return RecvOutcome::Dropped;
        }

        let (header, payload) = match DatagramHeader::deser(&scratch[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("{} dropping datagram from {}: {}", conn, from, e);
                return RecvOutcome::Dropped;
            }
        };

        self.timing.lock().last_received = Some(Instant::now());

        let receipt = {
            let mut tracker = self.tracker.lock();
            if payload.is_empty() {
                tracker.observe(header.id);
                None
            } else {
                Some(tracker.accept(header.id))
            }
        };

        self.process_acks(conn, &header);

        match receipt {
            None => {
                trace!("{} keepalive {} (ack {})", conn, header.id, header.ack);
                RecvOutcome::Received
            }
            Some(Receipt::Fresh) => {
                trace!("{} datagram {} with {} payload bytes", conn, header.id, payload.len());
                deliver(payload);
                RecvOutcome::Received
            }
            Some(Receipt::Duplicate) => {
                trace!("{} duplicate datagram {}", conn, header.id);
                RecvOutcome::Dropped
            }
            Some(Receipt::OutOfWindow) => {
                debug!("{} datagram {} is outside the ack window", conn, header.id);
                RecvOutcome::Dropped
            }
        }
    }

    /// Forget every packet the peer confirmed, sent or still queued.
    fn process_acks(&self, conn: ConnectionId, header: &DatagramHeader) {
        let acked = self.outstanding.lock().acknowledge(header);

        let mut queue = self.queue.lock();
        let unsent = header.acknowledged_ids().filter(|id| queue.remove(id).is_some()).count();
        if acked + unsent > 0 {
            trace!("{} ack {} released {} outstanding and {} queued packets", conn, header.ack, acked, unsent);
        }
    }

    pub fn discard(&self, conn: ConnectionId, scratch: &mut [u8]) {
        match self.socket.try_recv_from(scratch) {
            Ok((len, from)) => trace!("{} discarded {} bytes from {}", conn, len, from),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => debug!("{} discard failed: {}", conn, e),
        }
    }

    pub fn check_closed(&self, now: Instant) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return true;
        }
        if self.peer.lock().is_none() {
            return false;
        }

        match self.timing.lock().last_received {
            Some(last) => now.saturating_duration_since(last) >= self.config.connection_timeout,
            None => false,
        }
    }

    /// Re-queue packets due for resend and, if nothing has been sent for the
    /// keepalive interval, an empty datagram. Returns whether anything was
    /// queued.
    pub fn send_keepalive(&self, conn: ConnectionId, now: Instant) -> bool {
        if self.peer.lock().is_none() {
            return false;
        }

        let due = self.outstanding.lock().due_for_resend(now, self.config.resend_interval);
        let mut queued = 0;
        if !due.is_empty() {
            let headers: Vec<DatagramHeader> = {
                let tracker = self.tracker.lock();
                due.iter().map(|packet| tracker.header_for(packet.id)).collect()
            };

            let mut queue = self.queue.lock();
            for (packet, header) in due.into_iter().zip(headers) {
                queue.entry(packet.id).or_insert_with(|| QueuedPacket {
                    packet: OutgoingPacket::new(header, FailPolicy::Resend, packet.payload),
                    on_sent: None,
                });
                queued += 1;
            }
            debug!("{} resending {} unacknowledged packets", conn, queued);
        }

        if queued == 0 {
            let idle = now.saturating_duration_since(self.timing.lock().last_sent);
            if idle >= self.config.keepalive_interval {
                match self.enqueue(Bytes::new(), FailPolicy::Ignore, None) {
                    Ok(id) => {
                        trace!("{} queued keepalive {}", conn, id);
                        queued += 1;
                    }
                    Err(e) => warn!("{} could not queue keepalive: {}", conn, e),
                }
            }
        }

        queued > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn socket_pair() -> (Arc<UdpSocket>, Arc<UdpSocket>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (Arc::new(a), Arc::new(b))
    }

    fn connected(socket: &Arc<UdpSocket>, config: UdpConfig) -> UdpTransport {
        let peer = socket.peer_addr().unwrap();
        UdpTransport::connected(socket.clone(), peer.into(), config)
    }

    async fn recv_one(transport: &UdpTransport, scratch: &mut [u8]) -> (RecvOutcome, Vec<u8>) {
        transport.readable().await.unwrap();
        let mut delivered = Vec::new();
        let outcome = transport.recv(ConnectionId(0), scratch, |data| delivered = data.to_vec());
        (outcome, delivered)
    }

    #[tokio::test]
    async fn test_ids_are_sequential_and_acked() {
        let (a, b) = socket_pair().await;
        let sender = connected(&a, UdpConfig::default());
        let receiver = connected(&b, UdpConfig::default());
        let mut scratch = vec![0u8; 2048];

        assert_eq!(sender.enqueue(Bytes::from_static(b"one"), FailPolicy::Resend, None).unwrap(), 0);
        assert_eq!(sender.enqueue(Bytes::from_static(b"two"), FailPolicy::Resend, None).unwrap(), 1);
        sender.flush(ConnectionId(0)).await;
        assert_eq!(sender.unacked(), 2);

        let (outcome, data) = recv_one(&receiver, &mut scratch).await;
        assert_eq!(outcome, RecvOutcome::Received);
        assert_eq!(data, b"one");
        let (_, data) = recv_one(&receiver, &mut scratch).await;
        assert_eq!(data, b"two");

        // the reply carries ack 1 with bit 0 set for id 0
        receiver.enqueue(Bytes::from_static(b"ok"), FailPolicy::Ignore, None).unwrap();
        receiver.flush(ConnectionId(0)).await;
        let (_, data) = recv_one(&sender, &mut scratch).await;
        assert_eq!(data, b"ok");
        assert_eq!(sender.unacked(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_datagram_delivered_once() {
        let (a, b) = socket_pair().await;
        let receiver = connected(&b, UdpConfig::default());
        let mut scratch = vec![0u8; 2048];

        let datagram = DatagramHeader::new(0, -1, 0).frame(b"once");
        a.send(&datagram).await.unwrap();
        a.send(&datagram).await.unwrap();

        let (first, data) = recv_one(&receiver, &mut scratch).await;
        assert_eq!(first, RecvOutcome::Received);
        assert_eq!(data, b"once");

        let (second, data) = recv_one(&receiver, &mut scratch).await;
        assert_eq!(second, RecvOutcome::Dropped);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_short_datagram_dropped() {
        let (a, b) = socket_pair().await;
        let receiver = connected(&b, UdpConfig::default());
        let mut scratch = vec![0u8; 64];

        a.send(&[1, 2, 3]).await.unwrap();
        let (outcome, _) = recv_one(&receiver, &mut scratch).await;
        assert_eq!(outcome, RecvOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_resend_and_keepalive_queueing() {
        let (a, _b) = socket_pair().await;
        let config = UdpConfig::default()
            .with_resend_interval(Duration::from_millis(100))
            .with_keepalive_interval(Duration::from_millis(50));
        let sender = connected(&a, config);

        sender.enqueue(Bytes::from_static(b"lost"), FailPolicy::Resend, None).unwrap();
        sender.flush(ConnectionId(0)).await;
        let sent = Instant::now();

        // not yet due, but idle long enough for a keepalive
        assert!(sender.send_keepalive(ConnectionId(0), sent + Duration::from_millis(60)));
        assert_eq!(sender.queue.lock().keys().copied().collect::<Vec<_>>(), vec![1]);
        sender.flush(ConnectionId(0)).await;

        let later = Instant::now() + Duration::from_millis(150);
        assert!(sender.send_keepalive(ConnectionId(0), later));
        let queue = sender.queue.lock();
        let resent = queue.get(&0).unwrap();
        assert_eq!(resent.packet.policy, FailPolicy::Resend);
        assert_eq!(resent.packet.payload, Bytes::from_static(b"lost"));
        // keepalives are never tracked
        assert_eq!(sender.unacked(), 1);
    }

    #[tokio::test]
    async fn test_client_timeout_starts_at_first_receipt() {
        let (a, b) = socket_pair().await;
        let config = UdpConfig::default().with_connection_timeout(Duration::from_millis(200));
        let transport = connected(&a, config);
        let mut scratch = vec![0u8; 64];

        // nothing received yet, so no timeout however long it waits
        assert!(!transport.check_closed(Instant::now() + Duration::from_secs(60)));

        b.send(&DatagramHeader::new(0, -1, 0).to_bytes()).await.unwrap();
        let (outcome, _) = recv_one(&transport, &mut scratch).await;
        assert_eq!(outcome, RecvOutcome::Received);

        let now = Instant::now();
        assert!(!transport.check_closed(now));
        assert!(transport.check_closed(now + Duration::from_millis(250)));

        let fresh = connected(&a, UdpConfig::default());
        fresh.request_close();
        assert!(fresh.check_closed(Instant::now()));
    }

    #[tokio::test]
    async fn test_malformed_first_datagram_still_times_out() {
        let (a, b) = socket_pair().await;
        let config = UdpConfig::default().with_connection_timeout(Duration::from_millis(200));
        let transport = UdpTransport::accepted(a, config);
        let mut scratch = vec![0u8; 64];

        b.send(&[1, 2, 3]).await.unwrap();
        transport.adopt(b.local_addr().unwrap());
        let (outcome, _) = recv_one(&transport, &mut scratch).await;
        assert_eq!(outcome, RecvOutcome::Dropped);

        assert!(transport.check_closed(Instant::now() + Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_ack_during_write_releases_packet() {
        let (a, _b) = socket_pair().await;
        let sender = connected(&a, UdpConfig::default());

        sender.enqueue(Bytes::from_static(b"fast"), FailPolicy::Resend, None).unwrap();
        let staged = sender.stage();
        assert_eq!(staged.len(), 1);
        assert_eq!(sender.unacked(), 1);

        // the peer's ack is processed before the write completes
        sender.process_acks(ConnectionId(0), &DatagramHeader::new(0, 0, 0));
        assert_eq!(sender.unacked(), 0);
        assert!(!sender.send_keepalive(ConnectionId(0), Instant::now() + Duration::from_millis(10)));
        assert!(sender.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn test_claims_only_its_peer() {
        let (a, b) = socket_pair().await;
        let transport = UdpTransport::accepted(a, UdpConfig::default());
        let peer = b.local_addr().unwrap();
        let stranger: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(transport.claims(ConnectionId(0), peer));
        assert_eq!(transport.peer().unwrap().socket_addr(), peer);
        assert!(!transport.claims(ConnectionId(0), stranger));
        assert!(transport.claims(ConnectionId(0), peer));
    }

    #[tokio::test]
    async fn test_unknown_peer_keeps_queue() {
        let (a, b) = socket_pair().await;
        let transport = UdpTransport::accepted(a, UdpConfig::default());

        transport.enqueue(Bytes::from_static(b"wait"), FailPolicy::Resend, None).unwrap();
        transport.flush(ConnectionId(0)).await;

        assert_eq!(transport.queue.lock().len(), 1);
        assert_eq!(transport.unacked(), 0);
        assert!(!transport.check_closed(Instant::now() + Duration::from_secs(60)));

        // once the peer is adopted the queue drains to it
        transport.adopt(b.local_addr().unwrap());
        transport.flush(ConnectionId(0)).await;
        assert!(transport.queue.lock().is_empty());
        assert_eq!(transport.unacked(), 1);
    }
}
