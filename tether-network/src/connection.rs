//! One peer endpoint of a server or client socket.
//!
//! A [`Connection`] is owned by its socket's registry (server) or connection
//! slot (client). Applications receive `&Arc<Connection>` in callbacks and
//! [`WeakConnection`] handles from the registry accessors.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

use tether_core::{
    ConnectionId, FailPolicy, MessageAssembler, PacketValidator, PeerAddr, Protocol, Result, SendCallback,
    TetherError,
};

use crate::client::ClientShared;
use crate::server::ServerShared;
use crate::signal::SendSignal;
use crate::tcp::TcpTransport;
use crate::udp::UdpTransport;

/// Called once per complete inbound message.
pub type ReceiveCallback = Arc<dyn Fn(&Arc<Connection>, &[u8]) + Send + Sync>;

/// Called when a connection is established or closed.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct Callbacks {
    pub on_receive: Option<ReceiveCallback>,
    pub on_connect: Option<ConnectionCallback>,
    pub on_close: Option<ConnectionCallback>,
    pub validator: Option<PacketValidator>,
}

/// The socket a connection reports its removal to.
pub(crate) enum Owner {
    Server(Weak<ServerShared>),
    Client(Weak<ClientShared>),
}

pub(crate) enum Transport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
}

/// Result of one receive attempt on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvOutcome {
    /// Data was consumed (possibly a keepalive or an incomplete message)
    Received,
    /// Nothing to read right now
    Pending,
    /// The pending datagram comes from a different peer; it was not consumed
    NotForThisConnection,
    /// A datagram was consumed and discarded (malformed or duplicate)
    Dropped,
    /// The peer closed the stream
    Closed,
    /// The read failed
    Failed,
}

pub struct Connection {
    id: ConnectionId,
    owner: Owner,
    signal: Arc<SendSignal>,
    on_receive: Option<ReceiveCallback>,
    validator: Option<PacketValidator>,
    assembler: Mutex<MessageAssembler>,
    closed: AtomicBool,
    transport: Transport,
}

impl Connection {
    pub(crate) fn new(
        transport: Transport,
        owner: Owner,
        signal: Arc<SendSignal>,
        callbacks: &Callbacks,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            owner,
            signal,
            on_receive: callbacks.on_receive.clone(),
            validator: callbacks.validator.clone(),
            assembler: Mutex::new(MessageAssembler::new()),
            closed: AtomicBool::new(false),
            transport,
        });
        debug!("created {} connection {}", connection.protocol(), connection.id);
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        match self.transport {
            Transport::Tcp(_) => Protocol::Tcp,
            Transport::Udp(_) => Protocol::Udp,
        }
    }

    /// Address of the peer. A server-side UDP connection learns it from its
    /// first datagram.
    pub fn peer_addr(&self) -> Option<PeerAddr> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp.peer()),
            Transport::Udp(udp) => udp.peer(),
        }
    }

    pub fn hostname(&self) -> Option<String> {
        self.peer_addr().map(|peer| peer.hostname())
    }

    pub fn port(&self) -> Option<u16> {
        self.peer_addr().map(|peer| peer.port())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of sent UDP packets still waiting for an acknowledgement.
    pub fn unacked_packets(&self) -> usize {
        match &self.transport {
            Transport::Tcp(_) => 0,
            Transport::Udp(udp) => udp.unacked(),
        }
    }

    /// Queue `data` for sending; `on_sent` fires once the write was attempted.
    ///
    /// UDP data is sent with [`FailPolicy::Ignore`].
    pub fn send(&self, data: impl Into<Bytes>, on_sent: Option<SendCallback>) -> Result<()> {
        self.send_with_policy(data, FailPolicy::Ignore, on_sent)
    }

    /// Queue `data` with an explicit delivery policy. TCP ignores the policy.
    pub fn send_with_policy(
        &self,
        data: impl Into<Bytes>,
        policy: FailPolicy,
        on_sent: Option<SendCallback>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(TetherError::ConnectionClosed);
        }

        let data = data.into();
        match &self.transport {
            Transport::Tcp(tcp) => {
                trace!("{} queued {} bytes", self.id, data.len());
                tcp.enqueue(data, on_sent);
            }
            Transport::Udp(udp) => {
                let id = udp.enqueue(data, policy, on_sent)?;
                trace!("{} queued datagram {} ({:?})", self.id, id, policy);
            }
        }
        self.signal.signal();
        Ok(())
    }

    /// Close this connection through its owning socket.
    ///
    /// A server TCP connection is removed at once; a server UDP connection
    /// is removed on the next send-loop pass; a client connection stops its
    /// socket.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }

        match &self.owner {
            Owner::Server(server) => match (server.upgrade(), &self.transport) {
                (Some(server), Transport::Tcp(_)) => {
                    // not registered yet when called from OnConnect
                    if !server.remove_connection(self.id) {
                        self.mark_closed();
                    }
                }
                (Some(_), Transport::Udp(udp)) => {
                    debug!("{} marked closing", self.id);
                    udp.request_close();
                    self.signal.signal();
                }
                (None, _) => self.mark_closed(),
            },
            Owner::Client(client) => match client.upgrade() {
                Some(client) => client.stop(),
                None => self.mark_closed(),
            },
        }
    }

    pub fn downgrade(self: &Arc<Self>) -> WeakConnection {
        WeakConnection(Arc::downgrade(self))
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_stream(&self) {
        if let Transport::Tcp(tcp) = &self.transport {
            tcp.shutdown(self.id);
        }
    }

    pub(crate) async fn readable(&self) -> io::Result<()> {
        match &self.transport {
            Transport::Tcp(tcp) => tcp.readable().await,
            Transport::Udp(udp) => udp.readable().await,
        }
    }

    /// Write everything queued so far.
    pub(crate) async fn flush(&self) {
        match &self.transport {
            Transport::Tcp(tcp) => tcp.flush(self.id).await,
            Transport::Udp(udp) => udp.flush(self.id).await,
        }
    }

    /// Read once and deliver every message completed by that read.
    pub(crate) fn recv(self: &Arc<Self>, scratch: &mut [u8]) -> RecvOutcome {
        match &self.transport {
            Transport::Tcp(tcp) => tcp.recv(self.id, scratch, |data| self.deliver(data)),
            Transport::Udp(udp) => udp.recv(self.id, scratch, |data| self.deliver(data)),
        }
    }

    /// Consume and drop one pending datagram.
    pub(crate) fn discard_datagram(&self, scratch: &mut [u8]) {
        if let Transport::Udp(udp) = &self.transport {
            udp.discard(self.id, scratch);
        }
    }

    /// Whether a UDP connection should be removed. TCP connections are
    /// removed by the receive loop instead.
    pub(crate) fn check_closed(&self, now: Instant) -> bool {
        match &self.transport {
            Transport::Tcp(_) => false,
            Transport::Udp(udp) => udp.check_closed(now),
        }
    }

    /// Queue due retransmissions and, when idle, an empty keepalive.
    pub(crate) fn send_keepalive(&self, now: Instant) {
        if let Transport::Udp(udp) = &self.transport {
            if udp.send_keepalive(self.id, now) {
                self.signal.signal();
            }
        }
    }

    fn deliver(self: &Arc<Self>, data: &[u8]) {
        let Some(on_receive) = &self.on_receive else {
            trace!("{} has no receive callback, discarding {} bytes", self.id, data.len());
            return;
        };

        let mut assembler = self.assembler.lock();
        assembler.feed(data, self.validator.as_ref(), |message| on_receive(self, message));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol())
            .field("peer", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Observer handle that never keeps a connection alive.
#[derive(Debug, Clone, Default)]
pub struct WeakConnection(Weak<Connection>);

impl WeakConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The connection, if it still exists.
    pub fn upgrade(&self) -> Option<Arc<Connection>> {
        self.0.upgrade()
    }
}
