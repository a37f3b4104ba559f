use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

use tether_core::ConnectionId;

use crate::connection::Connection;

/// Live connections of a server socket, in registration order.
///
/// Every method takes the lock for its own duration only; callers iterate
/// over [`ConnectionRegistry::snapshot`] so the lock is never held while a
/// callback runs or I/O is awaited.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<Connection>>>,
    changed: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.lock().push(connection);
        self.changed.notify_one();
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut connections = self.connections.lock();
            let index = connections.iter().position(|conn| conn.id() == id)?;
            connections.remove(index)
        };
        self.changed.notify_one();
        Some(removed)
    }

    pub fn remove_at(&self, index: usize) -> Option<Arc<Connection>> {
        let removed = {
            let mut connections = self.connections.lock();
            if index >= connections.len() {
                return None;
            }
            connections.remove(index)
        };
        self.changed.notify_one();
        Some(removed)
    }

    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained = std::mem::take(&mut *self.connections.lock());
        self.changed.notify_one();
        drained
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        self.connections.lock().get(index).cloned()
    }

    pub fn find_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().iter().find(|conn| conn.id() == id).cloned()
    }

    /// First connection whose peer uses `port`.
    pub fn find_by_port(&self, port: u16) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .iter()
            .find(|conn| conn.port() == Some(port))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Resolves after the next add or remove.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
