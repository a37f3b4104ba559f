//! # Tether Network - Socket Runtime
//!
//! Callback-driven server and client sockets over two wire protocols:
//!
//! - **TCP**: a byte stream cut into messages by the application's packet
//!   validator
//! - **UDP**: datagrams carrying an acknowledgement header; packets sent with
//!   [`FailPolicy::Resend`] are retransmitted until the peer confirms them,
//!   and every id is delivered at most once
//!
//! Each running socket drives two tokio tasks, a send loop and a receive
//! loop. Callbacks are invoked from those tasks.
//!
//! ```rust,no_run
//! use tether_network::{ClientSocket, Protocol, ServerSocket};
//!
//! # async fn run() -> tether_core::Result<()> {
//! let mut server = ServerSocket::new(Protocol::Udp);
//! server.set_on_receive(|conn, data| {
//!     let _ = conn.send(data.to_vec(), None);
//! });
//! server.listen(7001).await?;
//!
//! let mut client = ClientSocket::new(Protocol::Udp);
//! client.set_on_receive(|_conn, data| println!("echo: {:?}", data));
//! client.connect("127.0.0.1", 7001).await?;
//! client.send(&b"hello"[..], None)?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
mod registry;
mod resolve;
pub mod server;
pub mod signal;
mod tcp;
mod udp;

pub use client::ClientSocket;
pub use connection::{Connection, ConnectionCallback, ReceiveCallback, WeakConnection};
pub use server::{ServerSocket, MIN_LISTEN_PORT};
pub use signal::SendSignal;

pub use tether_core::{
    ConnectionId, FailPolicy, PacketValidator, PeerAddr, Protocol, Result, SendCallback, SocketConfig, TetherError,
    UdpConfig,
};
