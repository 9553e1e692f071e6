//! Connection Manager
//!
//! Registry of independent [`Connection`]s, each with its own correlator,
//! subscription manager, and cache. Calls route to a connection by id;
//! monitoring interfaces merge every connection's events and errors into
//! single broadcast streams, each event tagged with its originating
//! connection id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::domain::ConnectionId;
use crate::error::{ApiError, ConnectionError};
use crate::infrastructure::config::ConnectionConfig;
use crate::infrastructure::connection::{Connection, ConnectionEvent};
use crate::infrastructure::transport::{TransportFactory, WebSocketFactory};

/// Capacity of the merged event/error broadcast channels. Monitoring is
/// lossy by design; subscription delivery is not affected.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry of all connections in one client.
pub struct ConnectionManager {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<ConnectionEvent>,
    errors_tx: broadcast::Sender<ConnectionEvent>,
    factory: Arc<dyn TransportFactory>,
}

impl ConnectionManager {
    /// Create a manager dialing through the given transport factory.
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (errors_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events_tx,
            errors_tx,
            factory,
        }
    }

    /// Create a manager dialing real WebSocket connections.
    #[must_use]
    pub fn with_websocket() -> Self {
        Self::new(Arc::new(WebSocketFactory::new()))
    }

    /// Construct, open, and register a new connection.
    ///
    /// # Errors
    ///
    /// Returns the dial failure; nothing is registered in that case.
    pub async fn create_connection(
        &self,
        config: ConnectionConfig,
    ) -> Result<ConnectionId, ApiError> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection::new(
            id,
            config,
            Arc::clone(&self.factory),
            self.events_tx.clone(),
            self.errors_tx.clone(),
        ));
        connection.open().await?;
        self.connections.write().insert(id, Arc::clone(&connection));
        tracing::info!(connection = %id, "Connection registered");
        Ok(id)
    }

    /// Resolve a connection by id.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::UnknownConnection`] for unregistered ids.
    pub fn get(&self, id: ConnectionId) -> Result<Arc<Connection>, ApiError> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(ApiError::Connection(ConnectionError::UnknownConnection(id)))
    }

    /// Ids of every registered connection, ascending.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Close one connection. It stays registered; routing to it still
    /// works but every call fails with `NotOpen`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::UnknownConnection`] for unregistered ids.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), ApiError> {
        let connection = self.get(id)?;
        connection.disconnect().await;
        Ok(())
    }

    /// Close and deregister one connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::UnknownConnection`] for unregistered ids.
    pub async fn remove_connection(&self, id: ConnectionId) -> Result<(), ApiError> {
        let connection = self
            .connections
            .write()
            .remove(&id)
            .ok_or(ApiError::Connection(ConnectionError::UnknownConnection(id)))?;
        connection.disconnect().await;
        tracing::info!(connection = %id, "Connection removed");
        Ok(())
    }

    /// Close every connection.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().values().cloned().collect();
        for connection in connections {
            connection.disconnect().await;
        }
    }

    /// Merged stream of every connection's events.
    #[must_use]
    pub fn monitor_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Merged stream of every connection's error-class events.
    #[must_use]
    pub fn monitor_errors(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.errors_tx.subscribe()
    }
}
