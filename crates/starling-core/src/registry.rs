//! Connection and listener registry.
//!
//! Owns every live [`Connection`] and [`Listener`] handle for its registered
//! lifetime. Registration allocates a fresh identifier that collides with no
//! live entry; unregistering an absent identifier is a no-op.
//!
//! Lookups hand out `Arc` clones so no map lock is ever held across a send.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

use crate::connection::{Connection, Listener};
use crate::id::ConnectId;

/// Live connections and listeners, keyed by [`ConnectId`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectId, Arc<dyn Connection>>,
    listeners: DashMap<ConnectId, Arc<dyn Listener>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate<V>(map: &DashMap<ConnectId, V>, value: V) -> ConnectId {
        let mut value = Some(value);
        loop {
            let id = ConnectId::random();
            if let Entry::Vacant(entry) = map.entry(id) {
                if let Some(value) = value.take() {
                    entry.insert(value);
                }
                return id;
            }
        }
    }

    /// Register a connection under a fresh id.
    pub fn register_connection(&self, connection: Arc<dyn Connection>) -> ConnectId {
        let address = connection.address();
        let id = Self::allocate(&self.connections, connection);
        tracing::debug!("Registered connection {} ({})", id, address);
        id
    }

    /// Remove a connection, returning it if it was registered.
    pub fn unregister_connection(&self, id: ConnectId) -> Option<Arc<dyn Connection>> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if removed.is_some() {
            tracing::debug!("Unregistered connection {}", id);
        }
        removed
    }

    /// Register a listener under a fresh id.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) -> ConnectId {
        let address = listener.address();
        let id = Self::allocate(&self.listeners, listener);
        tracing::debug!("Registered listener {} ({})", id, address);
        id
    }

    /// Remove a listener, returning it if it was registered.
    pub fn unregister_listener(&self, id: ConnectId) -> Option<Arc<dyn Listener>> {
        let removed = self.listeners.remove(&id).map(|(_, l)| l);
        if removed.is_some() {
            tracing::debug!("Unregistered listener {}", id);
        }
        removed
    }

    /// Look up a connection.
    #[must_use]
    pub fn connection(&self, id: ConnectId) -> Option<Arc<dyn Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a listener.
    #[must_use]
    pub fn listener(&self, id: ConnectId) -> Option<Arc<dyn Listener>> {
        self.listeners.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every connection except `exclude`.
    #[must_use]
    pub fn connections_except(&self, exclude: ConnectId) -> Vec<(ConnectId, Arc<dyn Connection>)> {
        self.connections
            .iter()
            .filter(|entry| *entry.key() != exclude)
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    /// Ids of every registered connection.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Ids of every registered listener.
    #[must_use]
    pub fn listener_ids(&self) -> Vec<ConnectId> {
        self.listeners.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::message::{ConnectorType, Message};
    use crate::node::Node;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Connection that records what it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingConnection {
        pub(crate) sent: Mutex<Vec<Message>>,
        pub(crate) fail: AtomicBool,
    }

    impl RecordingConnection {
        pub(crate) fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn handle(self: Arc<Self>, _node: Node, _id: ConnectId) {}

        fn send(&self, msg: &Message) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed);
            }
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn connector_type(&self) -> ConnectorType {
            ConnectorType::Memory
        }

        fn address(&self) -> String {
            "recording".into()
        }

        fn close(&self) {}
    }

    struct NullListener;

    impl Listener for NullListener {
        fn connector_type(&self) -> ConnectorType {
            ConnectorType::Memory
        }

        fn address(&self) -> String {
            "null".into()
        }

        fn close(&self) {}
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = ConnectionRegistry::new();
        let conn: Arc<dyn Connection> = Arc::new(RecordingConnection::default());

        let id = registry.register_connection(conn);
        assert!(!id.is_none());
        assert!(registry.connection(id).is_some());
        assert_eq!(registry.connection_count(), 1);

        assert!(registry.unregister_connection(id).is_some());
        assert!(registry.connection(id).is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = registry.register_connection(Arc::new(RecordingConnection::default()));

        assert!(registry.unregister_connection(id).is_some());
        assert!(registry.unregister_connection(id).is_none());
        assert!(registry.unregister_connection(ConnectId::random()).is_none());
        assert!(registry.unregister_listener(ConnectId::random()).is_none());
    }

    #[test]
    fn test_fresh_ids() {
        let registry = ConnectionRegistry::new();
        let ids: std::collections::HashSet<_> = (0..256)
            .map(|_| registry.register_connection(Arc::new(RecordingConnection::default())))
            .collect();
        assert_eq!(ids.len(), 256);
        assert_eq!(registry.connection_count(), 256);
    }

    #[test]
    fn test_connections_except() {
        let registry = ConnectionRegistry::new();
        let a = registry.register_connection(Arc::new(RecordingConnection::default()));
        let b = registry.register_connection(Arc::new(RecordingConnection::default()));

        let others: Vec<_> = registry
            .connections_except(a)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(others, vec![b]);
        assert_eq!(registry.connections_except(ConnectId::NONE).len(), 2);
    }

    #[test]
    fn test_listeners_separate() {
        let registry = ConnectionRegistry::new();
        let id = registry.register_listener(Arc::new(NullListener));
        assert!(registry.listener(id).is_some());
        assert!(registry.connection(id).is_none());
        assert_eq!(registry.listener_ids(), vec![id]);
        registry.unregister_listener(id);
        assert_eq!(registry.listener_count(), 0);
    }
}
