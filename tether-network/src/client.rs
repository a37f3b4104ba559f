//! Outbound socket holding exactly one connection.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::{FailPolicy, Protocol, Result, SendCallback, SocketConfig, TetherError};

use crate::connection::{Callbacks, Connection, Owner, RecvOutcome, Transport, WeakConnection};
use crate::resolve::{resolve, LastError};
use crate::signal::SendSignal;
use crate::tcp::TcpTransport;
use crate::udp::UdpTransport;

/// Resolution result kept for `reconnect`.
#[derive(Debug, Clone)]
struct Target {
    host: String,
    port: u16,
    addrs: Vec<SocketAddr>,
}

pub(crate) struct ClientShared {
    protocol: Protocol,
    config: SocketConfig,
    callbacks: RwLock<Callbacks>,
    signal: Arc<SendSignal>,
    connection: Mutex<Option<Arc<Connection>>>,
    target: Mutex<Option<Target>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_error: LastError,
}

/// Client side of a TCP or reliable-UDP transport.
///
/// Callbacks run on the socket's own tasks. Use [`Connection::close`] to end
/// the connection from inside a callback; [`ClientSocket::close`] waits for
/// those tasks and must not be awaited there.
pub struct ClientSocket {
    shared: Arc<ClientShared>,
}

impl ClientSocket {
    pub fn new(protocol: Protocol) -> Self {
        Self::with_config(protocol, SocketConfig::default())
    }

    pub fn with_config(protocol: Protocol, config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                protocol,
                config,
                callbacks: RwLock::new(Callbacks::default()),
                signal: Arc::new(SendSignal::new()),
                connection: Mutex::new(None),
                target: Mutex::new(None),
                running: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                last_error: LastError::default(),
            }),
        }
    }

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

    pub fn set_packet_validator<F>(&self, validator: F)
    where
        F: Fn(&[u8]) -> usize + Send + Sync + 'static,
    {
        self.shared.callbacks.write().validator = Some(Arc::new(validator));
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    /// Resolve `host` and connect to the first address that accepts.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        let shared = &self.shared;
        if port == 0 {
            return Err(shared.last_error.record(TetherError::InvalidPort { port }));
        }
        if self.is_connected() {
            return Err(shared.last_error.record(TetherError::AlreadyConnected));
        }
        shared.config.validate().map_err(|e| shared.last_error.record(e))?;

        let addrs = resolve(host, port).await.map_err(|e| shared.last_error.record(e))?;
        let target = Target {
            host: host.to_string(),
            port,
            addrs,
        };
        *shared.target.lock() = Some(target.clone());

        self.attempt(&target).await
    }

    /// Connect again to the addresses of the last successful resolution.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(self.shared.last_error.record(TetherError::AlreadyConnected));
        }

        let target = self.shared.target.lock().clone();
        let Some(target) = target else {
            let error = TetherError::not_connected("nothing to reconnect to");
            return Err(self.shared.last_error.record(error));
        };
        self.attempt(&target).await
    }

    async fn attempt(&mut self, target: &Target) -> Result<()> {
        self.join_tasks().await;

        for (attempt, addr) in target.addrs.iter().enumerate() {
            match self.open(*addr).await {
                Ok(transport) => {
                    self.start(transport);
                    info!("{} client connected to {}", self.shared.protocol, addr);
                    return Ok(());
                }
                Err(e) => warn!("connect attempt {} to {} failed: {}", attempt + 1, addr, e),
            }
        }

        Err(self.shared.last_error.record(TetherError::ConnectFailed {
            host: target.host.clone(),
            port: target.port,
            attempts: target.addrs.len(),
        }))
    }

    async fn open(&self, addr: SocketAddr) -> io::Result<Transport> {
        match self.shared.protocol {
            Protocol::Tcp => {
                let connecting = TcpStream::connect(addr);
                let stream = tokio::time::timeout(self.shared.config.connect_timeout, connecting)
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
                Ok(Transport::Tcp(TcpTransport::new(stream, addr.into())))
            }
            Protocol::Udp => {
                let local: SocketAddr = match addr {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                let transport = UdpTransport::connected(Arc::new(socket), addr.into(), self.shared.config.udp.clone());
                Ok(Transport::Udp(transport))
            }
        }
    }

    fn start(&self, transport: Transport) {
        let shared = &self.shared;
        let callbacks = shared.callbacks.read().clone();
        let conn = Connection::new(
            transport,
            Owner::Client(Arc::downgrade(shared)),
            shared.signal.clone(),
            &callbacks,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *shared.shutdown.lock() = Some(shutdown_tx);
        *shared.connection.lock() = Some(conn.clone());
        shared.running.store(true, Ordering::SeqCst);

        let sender = shared.clone();
        let send_conn = conn.clone();
        let send_shutdown = shutdown_rx.clone();
        let send_task = tokio::spawn(async move { sender.send_loop(send_conn, send_shutdown).await });

        let receiver = shared.clone();
        let recv_conn = conn.clone();
        let recv_task = tokio::spawn(async move { receiver.receive_loop(recv_conn, shutdown_rx).await });
        shared.tasks.lock().extend([send_task, recv_task]);

        let on_connect = shared.callbacks.read().on_connect.clone();
        if let Some(on_connect) = on_connect {
            on_connect(&conn);
        }
    }

    pub fn connection(&self) -> WeakConnection {
        self.shared
            .connection
            .lock()
            .as_ref()
            .map(|conn| conn.downgrade())
            .unwrap_or_default()
    }

    fn current(&self) -> Result<Arc<Connection>> {
        self.shared
            .connection
            .lock()
            .clone()
            .ok_or_else(|| TetherError::not_connected("client has no connection"))
    }

    pub fn send(&self, data: impl Into<Bytes>, on_sent: Option<SendCallback>) -> Result<()> {
        self.current()?.send(data, on_sent)
    }

    pub fn send_with_policy(
        &self,
        data: impl Into<Bytes>,
        policy: FailPolicy,
        on_sent: Option<SendCallback>,
    ) -> Result<()> {
        self.current()?.send_with_policy(data, policy, on_sent)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.get()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    /// Stop the connection and wait for both loops to finish.
    pub async fn close(&mut self) {
        self.shared.stop();
        self.join_tasks().await;
    }

    async fn join_tasks(&self) {
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("client task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl ClientShared {
    /// Stop both loops, shut the stream down and fire OnClose. Only the
    /// first call after a connect has any effect.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        self.signal.signal();

        let conn = self.connection.lock().take();
        if let Some(conn) = conn {
            conn.mark_closed();
            conn.shutdown_stream();
            info!("{} client connection {} closed", self.protocol, conn.id());

            let on_close = self.callbacks.read().on_close.clone();
            if let Some(on_close) = on_close {
                on_close(&conn);
            }
        }
    }

    async fn send_loop(self: Arc<Self>, conn: Arc<Connection>, mut shutdown: watch::Receiver<bool>) {
        let poll = match self.protocol {
            Protocol::Tcp => None,
            Protocol::Udp => Some(self.config.udp.send_poll_interval),
        };

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.signal.wait_timeout(poll) => {}
            }
            if conn.is_closed() {
                break;
            }

            conn.flush().await;
            if self.protocol == Protocol::Udp {
                let now = Instant::now();
                if conn.check_closed(now) {
                    info!("{} timed out", conn.id());
                    self.stop();
                    break;
                }
                conn.send_keepalive(now);
            }
        }
        debug!("{} client send loop stopped", self.protocol);
    }

    async fn receive_loop(self: Arc<Self>, conn: Arc<Connection>, mut shutdown: watch::Receiver<bool>) {
        let mut scratch = vec![0u8; self.config.read_buffer_size];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = conn.readable() => {
                    if let Err(e) = result {
                        warn!("{} readiness failed: {}", conn.id(), e);
                        self.stop();
                        break;
                    }

                    match conn.recv(&mut scratch) {
                        RecvOutcome::Closed => {
                            self.stop();
                            break;
                        }
                        RecvOutcome::Failed if self.protocol == Protocol::Tcp => {
                            self.stop();
                            break;
                        }
                        RecvOutcome::NotForThisConnection => conn.discard_datagram(&mut scratch),
                        _ => {}
                    }
                }
            }
        }
        debug!("{} client receive loop stopped", self.protocol);
    }
}
