//! # Tether Core - Transport Protocol Logic
//!
//! Socket-free building blocks of the Tether transport. Everything here is a
//! plain data structure driven by the network crate, so it can be tested
//! and benchmarked without opening a socket.
//!
//! ## Components
//!
//! - **Types**: `ConnectionId`, `Protocol`, `FailPolicy`, `PeerAddr`
//! - **Configuration**: `SocketConfig` and its nested `UdpConfig` timers
//! - **Wire Header**: the 12-byte acknowledgement header of reliable UDP
//! - **Framing**: the validator loop that carves messages out of a byte stream
//! - **Reliability**: the receiver's ack tracker and the sender's table of
//!   unacknowledged packets
//! - **Error Handling**: `TetherError` and the crate-wide `Result`
//!
//! ## Example
//!
//! ```rust
//! use tether_core::header::DatagramHeader;
//! use tether_core::reliability::{AckTracker, Receipt};
//!
//! let mut tracker = AckTracker::new();
//! for id in [0, 2, 3] {
//!     assert_eq!(tracker.accept(id), Receipt::Fresh);
//! }
//!
//! // the reply acknowledges 3 directly and 2 and 0 through the bitmap
//! let reply: DatagramHeader = tracker.header_for(0);
//! assert_eq!((reply.ack, reply.ack_bits), (3, 0b101));
//! ```

pub mod config;
pub mod error;
pub mod framing;
pub mod header;
pub mod reliability;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{SocketConfig, UdpConfig};
pub use error::*;
pub use framing::{MessageAssembler, PacketValidator, SendCallback};
pub use types::*;
