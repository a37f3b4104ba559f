use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Result, TetherError};

/// Configuration shared by server and client sockets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Host the server resolves and binds for `listen`
    pub bind_host: String,
    /// Backlog passed to `listen(2)` for TCP servers
    pub listen_backlog: i32,
    /// Size of the per-read scratch buffer (also the largest datagram accepted)
    pub read_buffer_size: usize,
    /// Upper bound for a single TCP connect attempt
    pub connect_timeout: Duration,
    /// Reliable-UDP timers
    pub udp: UdpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Silence after which an active connection is considered closed
    pub connection_timeout: Duration,
    /// Age after which an unacknowledged packet is sent again
    pub resend_interval: Duration,
    /// Idle time after which an empty datagram is sent to keep acks flowing
    pub keepalive_interval: Duration,
    /// Longest the send loop sleeps without a send request
    pub send_poll_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            listen_backlog: 5,
            read_buffer_size: 32 * 1024, // 32KB
            connect_timeout: Duration::from_secs(10),
            udp: UdpConfig::default(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            resend_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(250),
            send_poll_interval: Duration::from_millis(250),
        }
    }
}

impl SocketConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn with_listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_udp(mut self, udp: UdpConfig) -> Self {
        self.udp = udp;
        self
    }

    /// Parse a configuration from JSON; missing sections are rejected.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_host.is_empty() {
            return Err(TetherError::config("bind host must not be empty"));
        }
        if self.listen_backlog <= 0 {
            return Err(TetherError::config(format!(
                "listen backlog must be positive, got {}",
                self.listen_backlog
            )));
        }
        // a datagram must at least hold the reliability header
        if self.read_buffer_size < crate::header::HEADER_LEN {
            return Err(TetherError::config(format!(
                "read buffer of {} bytes cannot hold a datagram header",
                self.read_buffer_size
            )));
        }
        self.udp.validate()
    }
}

impl UdpConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_send_poll_interval(mut self, interval: Duration) -> Self {
        self.send_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.send_poll_interval.is_zero() {
            return Err(TetherError::config("send poll interval must be non-zero"));
        }
        if self.keepalive_interval >= self.connection_timeout {
            return Err(TetherError::config(format!(
                "keepalive interval {:?} must be shorter than the connection timeout {:?}",
                self.keepalive_interval, self.connection_timeout
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SocketConfig::default();
        assert_eq!(config.read_buffer_size, 32768);
        assert_eq!(config.listen_backlog, 5);
        assert_eq!(config.udp.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.udp.resend_interval, Duration::from_secs(1));
        assert_eq!(config.udp.keepalive_interval, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_overrides() {
        let config = SocketConfig::new()
            .with_bind_host("127.0.0.1")
            .with_udp(UdpConfig::new().with_connection_timeout(Duration::from_millis(800)));

        let json = config.to_json().unwrap();
        let parsed = SocketConfig::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let tiny_buffer = SocketConfig::new().with_read_buffer_size(4);
        assert!(matches!(tiny_buffer.validate(), Err(TetherError::Config { .. })));

        let slow_keepalive = SocketConfig::new().with_udp(
            UdpConfig::new()
                .with_keepalive_interval(Duration::from_secs(10))
                .with_connection_timeout(Duration::from_secs(5)),
        );
        assert!(slow_keepalive.validate().is_err());

        assert!(SocketConfig::from_json("{\"bind_host\": \"x\"}").is_err());
    }
}
