use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::connection::{Connection, ConnectionId};

/// The set of currently open connections.
///
/// Only the accept path inserts and only the disconnect path removes.
/// Readers take a copied [`snapshot`](Registry::snapshot) so no lock is held
/// while frames are being queued.
#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` visible to future broadcasts. Connections that already
    /// left `Open` are not inserted.
    pub async fn register(&self, conn: Arc<Connection>) {
        if !conn.is_open() {
            warn!(conn = %conn.id(), state = %conn.state(), "Refusing to register connection that is not open");
            return;
        }

        let id = conn.id();
        self.connections.write().await.insert(id, conn);
        info!(conn = %id, "Added connection to registry");
    }

    /// Remove a connection. Safe to call any number of times; returns
    /// whether this call removed it.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            info!(conn = %id, "Removed connection from registry");
        }
        removed
    }

    /// Remove and return every connection still registered.
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
