use std::time::Duration;
use tokio::sync::Notify;

/// Wakes a socket's send loop when data has been queued.
///
/// Holds at most one pending wake-up, so a signal raised while the loop is
/// busy flushing is not lost and many signals collapse into one pass.
#[derive(Debug, Default)]
pub struct SendSignal {
    notify: Notify,
}

impl SendSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait for a signal, giving up after `timeout` if one is given.
    /// Returns whether a signal arrived.
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait()).await.is_ok(),
            None => {
                self.wait().await;
                true
            }
        }
    }
}
