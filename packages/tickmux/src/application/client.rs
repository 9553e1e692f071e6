//! Client Facade
//!
//! [`ApiClient`] is the surface the owning application talks to. It wraps a
//! [`ConnectionManager`] and a default connection: the plain methods
//! (`send`, `subscribe`, `forget_all`, ...) target the default connection,
//! the `*_on` variants target an explicit connection id.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::ConnectionId;
use crate::domain::cache::CacheEntry;
use crate::domain::message::InboundMessage;
use crate::error::ApiError;
use crate::infrastructure::config::ConnectionConfig;
use crate::infrastructure::connection::{Connection, ConnectionEvent};
use crate::infrastructure::manager::ConnectionManager;
use crate::infrastructure::subscription::SubscriptionHandle;
use crate::infrastructure::transport::{TransportFactory, WebSocketFactory};

/// Multiplexing client for a trading-data service.
///
/// Cheap to clone; clones share the same connections.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use tickmux::{ApiClient, ConnectionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), tickmux::ApiError> {
/// let config = ConnectionConfig::builder()
///     .endpoint("stream.example.com")
///     .app_id("1089")
///     .build()?;
/// let client = ApiClient::connect(config).await?;
///
/// let pong = client.send(json!({"ping": 1})).await?;
/// assert_eq!(pong.msg_type.as_deref(), Some("ping"));
///
/// let mut ticks = client.subscribe(json!({"ticks": "R_100"})).await?;
/// while let Some(event) = ticks.next().await {
///     println!("{:?}", event?);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    manager: Arc<ConnectionManager>,
    default_id: ConnectionId,
}

impl ApiClient {
    /// Connect over a real WebSocket and make that connection the default.
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or the dial fails.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ApiError> {
        Self::with_factory(config, Arc::new(WebSocketFactory::new())).await
    }

    /// Connect through a custom transport factory. The factory is reused
    /// for every further `create_connection` and for reconnects.
    ///
    /// # Errors
    ///
    /// Fails when the dial fails.
    pub async fn with_factory(
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ApiError> {
        let manager = Arc::new(ConnectionManager::new(factory));
        let default_id = manager.create_connection(config).await?;
        Ok(Self {
            manager,
            default_id,
        })
    }

    /// The default connection's id.
    #[must_use]
    pub const fn default_connection(&self) -> ConnectionId {
        self.default_id
    }

    /// The underlying connection registry.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Resolve a connection by id.
    ///
    /// # Errors
    ///
    /// Fails for unknown connection ids.
    pub fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>, ApiError> {
        self.manager.get(id)
    }

    /// Open an additional connection and return its id.
    ///
    /// # Errors
    ///
    /// Fails when the dial fails; nothing is registered in that case.
    pub async fn create_connection(
        &self,
        config: ConnectionConfig,
    ) -> Result<ConnectionId, ApiError> {
        self.manager.create_connection(config).await
    }

    /// Send a request on the default connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`].
    pub async fn send(&self, request: Value) -> Result<InboundMessage, ApiError> {
        self.send_on(self.default_id, request).await
    }

    /// Send a request on an explicit connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_request`]; additionally fails for unknown
    /// connection ids.
    pub async fn send_on(
        &self,
        id: ConnectionId,
        request: Value,
    ) -> Result<InboundMessage, ApiError> {
        self.manager.get(id)?.send_request(request).await
    }

    /// Subscribe on the default connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::subscribe`].
    pub async fn subscribe(&self, request: Value) -> Result<SubscriptionHandle, ApiError> {
        self.subscribe_on(self.default_id, request).await
    }

    /// Subscribe on an explicit connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::subscribe`]; additionally fails for unknown
    /// connection ids.
    pub async fn subscribe_on(
        &self,
        id: ConnectionId,
        request: Value,
    ) -> Result<SubscriptionHandle, ApiError> {
        self.manager.get(id)?.subscribe(request).await
    }

    /// Detach one subscription handle, cancelling the remote subscription
    /// when it was the source's last handle. The handle knows which
    /// connection it belongs to.
    ///
    /// # Errors
    ///
    /// See [`Connection::forget`].
    pub async fn forget(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<Option<InboundMessage>, ApiError> {
        self.manager
            .get(handle.connection_id())?
            .forget(handle)
            .await
    }

    /// Cancel every subscription of the given kinds (all kinds when empty)
    /// on the default connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::forget_all`].
    pub async fn forget_all(&self, kinds: &[&str]) -> Result<InboundMessage, ApiError> {
        self.forget_all_on(self.default_id, kinds).await
    }

    /// Cancel every subscription of the given kinds on an explicit
    /// connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::forget_all`]; additionally fails for unknown
    /// connection ids.
    pub async fn forget_all_on(
        &self,
        id: ConnectionId,
        kinds: &[&str],
    ) -> Result<InboundMessage, ApiError> {
        self.manager.get(id)?.forget_all(kinds).await
    }

    /// Cached response for a request shape on the default connection.
    /// Never blocks, never touches the network.
    ///
    /// # Errors
    ///
    /// Fails when the default connection was removed from the registry.
    pub fn cached(&self, request: &Value) -> Result<Option<CacheEntry>, ApiError> {
        self.cached_on(self.default_id, request)
    }

    /// Cached response for a request shape on an explicit connection.
    ///
    /// # Errors
    ///
    /// Fails for unknown connection ids.
    pub fn cached_on(
        &self,
        id: ConnectionId,
        request: &Value,
    ) -> Result<Option<CacheEntry>, ApiError> {
        Ok(self.manager.get(id)?.cached(request))
    }

    /// Close the default connection.
    ///
    /// # Errors
    ///
    /// Fails when the default connection was removed from the registry.
    pub async fn disconnect(&self) -> Result<(), ApiError> {
        self.manager.disconnect(self.default_id).await
    }

    /// Close an explicit connection.
    ///
    /// # Errors
    ///
    /// Fails for unknown connection ids.
    pub async fn disconnect_on(&self, id: ConnectionId) -> Result<(), ApiError> {
        self.manager.disconnect(id).await
    }

    /// Close every connection.
    pub async fn disconnect_all(&self) {
        self.manager.disconnect_all().await;
    }

    /// Merged monitoring events across all connections, tagged with their
    /// originating connection id.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.monitor_events()
    }

    /// Merged error-class events across all connections.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.monitor_errors()
    }
}
