//! # Error Types
//!
//! Error handling for socket setup and connection operations.

use thiserror::Error;

/// Error types that can occur while setting up or using a transport.
///
/// Per-operation I/O failures inside the send and receive loops are logged
/// and never surface here; this enum covers the failures a caller can act on.
///
/// # Error Categories
///
/// - **Setup Errors**: invalid ports, sockets opened twice, resolution,
///   bind and connect failures
/// - **Connection Errors**: sending on a closed or missing connection
/// - **Protocol Errors**: malformed datagrams, exhausted sequence space
/// - **Configuration Errors**: invalid or unparsable settings
///
/// # Examples
///
/// ```rust
/// use tether_core::TetherError;
///
/// let error = TetherError::InvalidPort { port: 80 };
/// assert_eq!(error.to_string(), "Port out of range: 80");
/// ```
#[derive(Error, Debug)]
pub enum TetherError {
    /// Requested port is outside the accepted range
    #[error("Port out of range: {port}")]
    InvalidPort { port: u16 },

    /// `listen` was called on a socket that is already running
    #[error("Socket already open")]
    AlreadyOpen,

    /// `connect`/`reconnect` was called while a connection exists
    #[error("Already connected")]
    AlreadyConnected,

    /// Operation requires a connection that does not exist
    #[error("Not connected: {message}")]
    NotConnected { message: String },

    /// The connection has been closed and no longer accepts data
    #[error("Connection closed")]
    ConnectionClosed,

    /// Host name resolution failed or produced no usable address
    #[error("Could not resolve {host}: {message}")]
    Resolution { host: String, message: String },

    /// Every candidate address failed to bind
    #[error("Could not bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// Every candidate address failed to connect
    #[error("All connect attempts to {host}:{port} failed ({attempts} attempted)")]
    ConnectFailed {
        host: String,
        port: u16,
        attempts: usize,
    },

    /// Datagram is too short to carry the reliability header
    #[error("Malformed datagram: {len} bytes")]
    MalformedDatagram { len: usize },

    /// The 31-bit outgoing id space of a UDP connection is used up
    #[error("Outgoing sequence ids exhausted")]
    SequenceExhausted,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket or file I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results returned by Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl TetherError {
    /// Creates a new not-connected error with the given message.
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    /// Creates a new resolution error for `host`.
    pub fn resolution(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new bind error for `addr`.
    pub fn bind(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bind {
            addr: addr.into(),
            message: message.into(),
        }
    }

    /// Creates a new configuration error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tether_core::TetherError;
    ///
    /// let error = TetherError::config("read buffer must not be empty");
    /// assert!(!error.is_retryable());
    /// ```
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a new internal error with the given message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Determines if this error condition is potentially recoverable.
    ///
    /// Retryable errors are transient: a later `connect`, `reconnect` or
    /// `listen` may succeed once the network or the peer recovers.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tether_core::TetherError;
    ///
    /// let refused = TetherError::ConnectFailed {
    ///     host: "localhost".to_string(),
    ///     port: 9000,
    ///     attempts: 2,
    /// };
    /// assert!(refused.is_retryable());
    /// assert!(!TetherError::InvalidPort { port: 1 }.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::Resolution { .. }
                | Self::Bind { .. }
                | Self::Io(_)
        )
    }
}
