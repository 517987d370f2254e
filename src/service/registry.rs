//! The set of live connections owned by a service.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::connection::Connection;

/// Identity of a connection within its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maps connection ids to the connections they name.
///
/// The registry holds the service's strong reference to each connection;
/// removing an entry is the only way that reference is released.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a fresh, never reused id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Registers `connection` under its own id.
    pub fn insert(&self, connection: Arc<Connection>) {
        self.lock().insert(connection.id(), connection);
    }

    /// Deregisters `id`, handing back the registry's reference.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().remove(&id)
    }

    /// The connection registered under `id`.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes every connection, returning them so they can be closed
    /// without holding the registry lock.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().map(|(_, c)| c).collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let registry = ConnectionRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        assert!(b > a);
        assert_eq!(a.to_string(), "#1");
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let id = registry.next_id();
        let (connection, _queue) = Connection::detached(id);
        registry.insert(connection);
        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        for _ in 0..3 {
            let (connection, _queue) = Connection::detached(registry.next_id());
            registry.insert(connection);
        }
        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
    }
}
