use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use tether_core::{Result, TetherError};

/// Every address `host` resolves to for `port`, in resolver order.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| TetherError::resolution(host, e.to_string()))?
        .collect();

    if addrs.is_empty() {
        return Err(TetherError::resolution(host, "no addresses found"));
    }
    debug!("{}:{} resolved to {:?}", host, port, addrs);
    Ok(addrs)
}

/// Message of the most recent setup failure of a socket.
#[derive(Debug, Default)]
pub(crate) struct LastError(Mutex<Option<String>>);

impl LastError {
    /// Remember `error` and hand it back for returning.
    pub fn record(&self, error: TetherError) -> TetherError {
        warn!("{}", error);
        *self.0.lock() = Some(error.to_string());
        error
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let addrs = resolve("127.0.0.1", 4242).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:4242".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_last_error_keeps_latest() {
        let last = LastError::default();
        assert!(last.get().is_none());

        last.record(TetherError::AlreadyOpen);
        last.record(TetherError::InvalidPort { port: 7 });
        assert_eq!(last.get().as_deref(), Some("Port out of range: 7"));
    }
}
