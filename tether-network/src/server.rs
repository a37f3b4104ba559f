//! Listening socket with a registry of live connections.
//!
//! A running server owns exactly two tasks: the send loop flushes every
//! connection when signalled (and, for UDP, drives retransmission, keepalives
//! and timeouts), the receive loop accepts peers and reads from them.

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use tether_core::{ConnectionId, Protocol, Result, SocketConfig, TetherError};

use crate::connection::{Callbacks, Connection, Owner, RecvOutcome, Transport, WeakConnection};
use crate::registry::ConnectionRegistry;
use crate::resolve::{resolve, LastError};
use crate::signal::SendSignal;
use crate::tcp::TcpTransport;
use crate::udp::UdpTransport;

/// Lowest port `listen` accepts.
pub const MIN_LISTEN_PORT: u16 = 1024;

enum Listener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

pub(crate) struct ServerShared {
    protocol: Protocol,
    config: SocketConfig,
    callbacks: RwLock<Callbacks>,
    registry: ConnectionRegistry,
    signal: Arc<SendSignal>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    last_error: LastError,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Server side of a TCP or reliable-UDP transport.
///
/// # Examples
///
/// ```rust,no_run
/// use tether_network::{Protocol, ServerSocket};
///
/// # async fn run() -> tether_core::Result<()> {
/// let mut server = ServerSocket::new(Protocol::Tcp);
/// server.set_on_receive(|conn, data| {
///     let _ = conn.send(data.to_vec(), None);
/// });
/// server.listen(7000).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerSocket {
    shared: Arc<ServerShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerSocket {
    pub fn new(protocol: Protocol) -> Self {
        Self::with_config(protocol, SocketConfig::default())
    }

    pub fn with_config(protocol: Protocol, config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                protocol,
                config,
                callbacks: RwLock::new(Callbacks::default()),
                registry: ConnectionRegistry::new(),
                signal: Arc::new(SendSignal::new()),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                last_error: LastError::default(),
                shutdown: Mutex::new(None),
            }),
            tasks: Vec::new(),
        }
    }

    /// Receive callback for connections created from now on.
    pub fn set_on_receive<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().on_receive = Some(Arc::new(callback));
    }

    pub fn set_on_connect<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().on_connect = Some(Arc::new(callback));
    }

    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().on_close = Some(Arc::new(callback));
    }

    /// Message delimiter for connections created from now on.
    pub fn set_packet_validator<F>(&self, validator: F)
    where
        F: Fn(&[u8]) -> usize + Send + Sync + 'static,
    {
        self.shared.callbacks.write().validator = Some(Arc::new(validator));
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    /// Bind the configured host on `port` and start the send and receive
    /// loops.
    pub async fn listen(&mut self, port: u16) -> Result<()> {
        let shared = &self.shared;
        if shared.running.load(Ordering::SeqCst) {
            return Err(shared.last_error.record(TetherError::AlreadyOpen));
        }
        if port < MIN_LISTEN_PORT {
            return Err(shared.last_error.record(TetherError::InvalidPort { port }));
        }
        shared.config.validate().map_err(|e| shared.last_error.record(e))?;

        let candidates = resolve(&shared.config.bind_host, port)
            .await
            .map_err(|e| shared.last_error.record(e))?;

        let mut bound = None;
        let mut failure = String::new();
        for addr in &candidates {
            match bind(shared.protocol, *addr, shared.config.listen_backlog) {
                Ok(listener) => {
                    bound = Some((listener, *addr));
                    break;
                }
                Err(e) => {
                    warn!("could not bind {} {}: {}", shared.protocol, addr, e);
                    failure = e.to_string();
                }
            }
        }
        let Some((listener, addr)) = bound else {
            let target = format!("{}:{}", shared.config.bind_host, port);
            return Err(shared.last_error.record(TetherError::bind(target, failure)));
        };

        let local_addr = match &listener {
            Listener::Tcp(tcp) => tcp.local_addr(),
            Listener::Udp(udp) => udp.local_addr(),
        }
        .unwrap_or(addr);
        *shared.local_addr.lock() = Some(local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *shared.shutdown.lock() = Some(shutdown_tx);
        shared.running.store(true, Ordering::SeqCst);

        let sender = shared.clone();
        let send_shutdown = shutdown_rx.clone();
        self.tasks
            .push(tokio::spawn(async move { sender.send_loop(send_shutdown).await }));

        let receiver = shared.clone();
        self.tasks
            .push(tokio::spawn(async move { receiver.receive_loop(listener, shutdown_rx).await }));

        info!("{} server listening on {}", shared.protocol, local_addr);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<WeakConnection> {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(|conn| conn.downgrade())
            .collect()
    }

    pub fn connection(&self, index: usize) -> WeakConnection {
        self.shared
            .registry
            .get(index)
            .map(|conn| conn.downgrade())
            .unwrap_or_default()
    }

    pub fn connection_by_id(&self, id: ConnectionId) -> WeakConnection {
        self.shared
            .registry
            .find_by_id(id)
            .map(|conn| conn.downgrade())
            .unwrap_or_default()
    }

    pub fn connection_by_port(&self, port: u16) -> WeakConnection {
        self.shared
            .registry
            .find_by_port(port)
            .map(|conn| conn.downgrade())
            .unwrap_or_default()
    }

    pub fn num_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Remove `connection` and fire OnClose. Returns false if it was no
    /// longer registered.
    pub fn close_connection(&self, connection: &Connection) -> bool {
        self.shared.remove_connection(connection.id())
    }

    pub fn close_connection_at(&self, index: usize) -> bool {
        match self.shared.registry.remove_at(index) {
            Some(conn) => {
                self.shared.finish_removal(&conn);
                true
            }
            None => false,
        }
    }

    /// Stop both loops, release the listening socket and close every
    /// remaining connection.
    pub async fn close(&mut self) {
        self.shared.request_stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("server task ended abnormally: {}", e);
            }
        }
        *self.shared.local_addr.lock() = None;

        for conn in self.shared.registry.drain() {
            self.shared.finish_removal(&conn);
        }
        info!("{} server closed", self.shared.protocol);
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

impl ServerShared {
    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        self.signal.signal();
    }

    /// Unregister the connection with `id`, shut it down and fire OnClose.
    pub(crate) fn remove_connection(&self, id: ConnectionId) -> bool {
        match self.registry.remove(id) {
            Some(conn) => {
                self.finish_removal(&conn);
                true
            }
            None => false,
        }
    }

    fn finish_removal(&self, conn: &Arc<Connection>) {
        conn.mark_closed();
        conn.shutdown_stream();
        debug!("{} removed from {} server", conn.id(), self.protocol);

        let on_close = self.callbacks.read().on_close.clone();
        if let Some(on_close) = on_close {
            on_close(conn);
        }
    }

    fn register(self: &Arc<Self>, transport: Transport) -> Arc<Connection> {
        let callbacks = self.callbacks.read().clone();
        let conn = Connection::new(
            transport,
            Owner::Server(Arc::downgrade(self)),
            self.signal.clone(),
            &callbacks,
        );

        let on_connect = self.callbacks.read().on_connect.clone();
        if let Some(on_connect) = on_connect {
            on_connect(&conn);
        }
        if conn.is_closed() {
            debug!("{} closed during OnConnect", conn.id());
            self.finish_removal(&conn);
            return conn;
        }
        self.registry.add(conn.clone());
        conn
    }

    async fn send_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = match self.protocol {
            Protocol::Tcp => None,
            Protocol::Udp => Some(self.config.udp.send_poll_interval),
        };
        debug!("{} server send loop started", self.protocol);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.signal.wait_timeout(poll) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            for conn in self.registry.snapshot() {
                conn.flush().await;
                if self.protocol == Protocol::Udp {
                    let now = Instant::now();
                    if conn.check_closed(now) {
                        debug!("{} is closing or timed out", conn.id());
                        self.remove_connection(conn.id());
                    } else {
                        conn.send_keepalive(now);
                    }
                }
            }
        }

        debug!("{} server send loop stopped", self.protocol);
    }

    async fn receive_loop(self: Arc<Self>, listener: Listener, mut shutdown: watch::Receiver<bool>) {
        let mut scratch = vec![0u8; self.config.read_buffer_size];
        debug!("{} server receive loop started", self.protocol);

        match listener {
            Listener::Tcp(listener) => self.receive_tcp(listener, &mut scratch, &mut shutdown).await,
            Listener::Udp(socket) => self.receive_udp(socket, &mut scratch, &mut shutdown).await,
        }

        debug!("{} server receive loop stopped", self.protocol);
    }

    async fn receive_tcp(
        self: &Arc<Self>,
        listener: TcpListener,
        scratch: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut ready: FuturesUnordered<_> = self
                .registry
                .snapshot()
                .into_iter()
                .map(|conn| async move {
                    let result = conn.readable().await;
                    (conn, result)
                })
                .collect();

            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept_tcp(stream, addr),
                    Err(e) => {
                        self.last_error.record(TetherError::Io(e));
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some((conn, result)) = ready.next() => {
                    let outcome = match result {
                        Ok(()) => conn.recv(scratch),
                        Err(e) => {
                            warn!("{} readiness failed: {}", conn.id(), e);
                            RecvOutcome::Failed
                        }
                    };
                    if matches!(outcome, RecvOutcome::Closed | RecvOutcome::Failed) {
                        self.remove_connection(conn.id());
                    }
                },
                _ = self.registry.changed() => {}
            }
        }
    }

    fn accept_tcp(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
            warn!("could not enable keepalive for {}: {}", addr, e);
        }

        let conn = self.register(Transport::Tcp(TcpTransport::new(stream, addr.into())));
        info!("accepted {} from {}", conn.id(), addr);
    }

    async fn receive_udp(
        self: &Arc<Self>,
        socket: Arc<UdpSocket>,
        scratch: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = socket.readable() => match result {
                    Ok(()) => self.dispatch_datagrams(&socket, scratch),
                    Err(e) => warn!("udp readiness failed: {}", e),
                },
            }
        }
    }

    /// Hand each pending datagram to the connection of its sender, creating
    /// a pseudo-connection for unknown senders.
    fn dispatch_datagrams(self: &Arc<Self>, socket: &Arc<UdpSocket>, scratch: &mut [u8]) {
        loop {
            let sender = match socket.try_peek_sender() {
                Ok(sender) => sender,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("dropping unreadable datagram: {}", e);
                    let _ = socket.try_recv_from(scratch);
                    return;
                }
            };

            let mut claimed = false;
            for conn in self.registry.snapshot() {
                match conn.recv(scratch) {
                    RecvOutcome::NotForThisConnection => continue,
                    RecvOutcome::Pending => return,
                    outcome => {
                        trace!("{} claimed datagram: {:?}", conn.id(), outcome);
                        claimed = true;
                        break;
                    }
                }
            }

            if !claimed {
                let transport = UdpTransport::accepted(socket.clone(), self.config.udp.clone());
                transport.adopt(sender);
                let conn = self.register(Transport::Udp(transport));
                info!("new {} from {}", conn.id(), sender);
                let outcome = if conn.is_closed() {
                    conn.discard_datagram(scratch);
                    RecvOutcome::Dropped
                } else {
                    conn.recv(scratch)
                };
                if outcome == RecvOutcome::Pending {
                    return;
                }
            }
        }
    }
}

fn bind(protocol: Protocol, addr: SocketAddr, backlog: i32) -> io::Result<Listener> {
    let domain = Domain::for_address(addr);
    let socket = match protocol {
        Protocol::Tcp => Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?,
        Protocol::Udp => Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?,
    };

    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    match protocol {
        Protocol::Tcp => {
            socket.listen(backlog)?;
            Ok(Listener::Tcp(TcpListener::from_std(socket.into())?))
        }
        Protocol::Udp => Ok(Listener::Udp(Arc::new(UdpSocket::from_std(socket.into())?))),
    }
}
