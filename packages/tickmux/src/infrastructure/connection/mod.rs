//! Connection and Message Pump
//!
//! One [`Connection`] owns one transport session at a time, a request
//! correlator, a subscription manager, and a response cache. A spawned pump
//! task drains inbound frames in wire order and routes each one: pending
//! request first, then subscription fan-out, else unmatched.
//!
//! # Lifecycle
//!
//! `Connecting → Open` on a successful dial. On transport failure, every
//! pending request fails with a connection error and every subscription
//! source terminates — nothing is buffered or retried across a reconnect.
//! With auto-reconnect enabled the connection then moves through
//! `Reconnecting` per the backoff schedule back to `Open` (correlation ids
//! keep incrementing), otherwise, or once attempts are exhausted, it ends
//! `Closed`.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::ConnectionId;
use crate::domain::cache::{CacheEntry, ResponseCache};
use crate::domain::fingerprint::RequestFingerprint;
use crate::domain::message::{InboundMessage, entity_id_of, stream_kind_of};
use crate::error::{ApiError, ConnectionError, ConstructionError};
use crate::infrastructure::config::ConnectionConfig;
use crate::infrastructure::subscription::{
    Activation, AttachOutcome, CreationOutcome, Detach, SubscriptionHandle, SubscriptionManager,
};
use crate::infrastructure::transport::{
    Transport, TransportError, TransportFactory, TransportSink, TransportStream,
};

mod correlator;
pub mod reconnect;

use correlator::{RequestCorrelator, Resolution};
use reconnect::ReconnectPolicy;

// =============================================================================
// Lifecycle Types
// =============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but not yet dialed.
    Connecting,
    /// Live and accepting traffic.
    Open,
    /// Transport lost; redialing per the backoff schedule.
    Reconnecting,
    /// Permanently closed.
    Closed,
}

impl ConnectionState {
    /// Whether the connection accepts traffic right now.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// One monitoring event, tagged with its originating connection.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Connection the event originated from.
    pub connection_id: ConnectionId,
    /// What happened.
    pub kind: ConnectionEventKind,
}

/// Kinds of monitoring events a connection emits.
#[derive(Debug, Clone)]
pub enum ConnectionEventKind {
    /// The transport session is established.
    Connected,
    /// The transport session ended.
    Disconnected {
        /// Failure description; `None` for an orderly disconnect.
        reason: Option<String>,
    },
    /// A reconnect attempt is about to be made.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
    },
    /// A reconnect attempt failed.
    ReconnectFailed {
        /// Attempt number that failed.
        attempt: u32,
        /// Dial error description.
        error: String,
    },
    /// The connection recovered onto a fresh transport session.
    Reconnected,
    /// Reconnect attempts are exhausted; the connection is closed.
    ReconnectExhausted,
    /// A request was written to the wire.
    RequestSent {
        /// Correlation id of the request.
        req_id: u64,
    },
    /// An inbound message was received and dispatched.
    MessageReceived {
        /// The message's logical kind, when present.
        msg_type: Option<String>,
    },
    /// An inbound message matched neither a pending request nor a source.
    Unmatched {
        /// Correlation id carried by the message, if any.
        req_id: Option<u64>,
    },
}

impl ConnectionEventKind {
    /// Whether this event reports a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Disconnected { reason: Some(_) }
                | Self::ReconnectFailed { .. }
                | Self::ReconnectExhausted
        )
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One persistent connection to the remote service.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct ConnectionInner {
    id: ConnectionId,
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    correlator: RequestCorrelator,
    subscriptions: SubscriptionManager,
    cache: ResponseCache,
    state_tx: watch::Sender<ConnectionState>,
    outbound: parking_lot::RwLock<Option<mpsc::UnboundedSender<String>>>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    errors_tx: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        config: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        events_tx: broadcast::Sender<ConnectionEvent>,
        errors_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                config,
                factory,
                correlator: RequestCorrelator::new(),
                subscriptions: SubscriptionManager::new(),
                cache: ResponseCache::new(),
                state_tx,
                outbound: parking_lot::RwLock::new(None),
                events_tx,
                errors_tx,
                cancel: CancellationToken::new(),
                pump: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// This connection's id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// This connection's configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The connection's response cache.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.inner.cache
    }

    /// Cached response for a request shape, if any. Never blocks.
    #[must_use]
    pub fn cached(&self, request: &Value) -> Option<CacheEntry> {
        self.inner.cache.get(&RequestFingerprint::of(request))
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_len()
    }

    /// Number of live subscription sources.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.source_count()
    }

    /// Dial the transport and start the message pump.
    ///
    /// # Errors
    ///
    /// Returns the dial failure verbatim; a closed connection reports
    /// [`ConnectionError::NotOpen`]. Opening an already open connection is
    /// a no-op.
    pub async fn open(&self) -> Result<(), ApiError> {
        match self.state() {
            ConnectionState::Open | ConnectionState::Reconnecting => return Ok(()),
            ConnectionState::Closed => {
                return Err(ApiError::Connection(ConnectionError::NotOpen(self.inner.id)));
            }
            ConnectionState::Connecting => {}
        }

        let transport = match self.inner.factory.connect(&self.inner.config).await {
            Ok(transport) => transport,
            Err(error) => {
                self.inner.state_tx.send_replace(ConnectionState::Closed);
                return Err(error.into());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.inner.outbound.write() = Some(outbound_tx);
        self.inner.state_tx.send_replace(ConnectionState::Open);
        self.inner.emit(ConnectionEventKind::Connected);
        tracing::info!(connection = %self.inner.id, endpoint = self.inner.config.endpoint(), "Connection open");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_pump(inner, transport, outbound_rx));
        *self.inner.pump.lock() = Some(handle);
        Ok(())
    }

    /// Send a request and suspend until its correlated response arrives.
    ///
    /// # Errors
    ///
    /// Fails with [`ApiError::Remote`] when the service answers with an
    /// error object, with [`ApiError::Connection`] when the connection is
    /// not open or dies while the call is in flight, and with
    /// [`ApiError::Construction`] for malformed requests.
    pub async fn send_request(&self, request: Value) -> Result<InboundMessage, ApiError> {
        let mut request = request;
        if !request.is_object() {
            return Err(ApiError::Construction(ConstructionError::PayloadNotAnObject));
        }
        if let Some(short) = self.inner.config.middleware().before_send(&mut request) {
            return Ok(short);
        }

        let fingerprint = RequestFingerprint::of(&request);
        let response = self
            .inner
            .request_response(request.clone(), fingerprint)
            .await?;

        if let Some(replaced) = self
            .inner
            .config
            .middleware()
            .after_receive(&request, &response)
        {
            return Ok(replaced);
        }
        Ok(response)
    }

    /// Subscribe to a streaming request.
    ///
    /// An identical subscription already live on this connection is shared:
    /// the returned handle attaches to the existing source and nothing is
    /// sent to the remote side. Otherwise the subscribe request goes
    /// through the correlator and the confirmation becomes the handle's
    /// first event.
    ///
    /// # Errors
    ///
    /// Fails like [`send_request`](Self::send_request); additionally,
    /// requests matching no configured stream kind are rejected with a
    /// [`ConstructionError`] before anything is sent.
    pub async fn subscribe(&self, request: Value) -> Result<SubscriptionHandle, ApiError> {
        let mut request = request;
        if !request.is_object() {
            return Err(ApiError::Construction(ConstructionError::PayloadNotAnObject));
        }
        if self
            .inner
            .config
            .middleware()
            .before_send(&mut request)
            .is_some()
        {
            tracing::warn!(
                connection = %self.inner.id,
                "Middleware short-circuit ignored for a streaming call"
            );
        }

        let Some(kind) = stream_kind_of(&request, self.inner.config.stream_kinds()) else {
            let keys = request
                .as_object()
                .map(|object| object.keys().cloned().collect::<Vec<_>>().join(", "))
                .unwrap_or_default();
            return Err(ApiError::Construction(
                ConstructionError::UnsupportedStreamKind(keys),
            ));
        };
        let kind = kind.to_owned();
        let fingerprint = RequestFingerprint::of(&request);
        let entity = entity_id_of(&request);

        match self.inner.subscriptions.attach_or_begin(
            self.inner.id,
            fingerprint.clone(),
            &kind,
            entity,
        ) {
            AttachOutcome::Attached(handle) => Ok(handle),
            AttachOutcome::Waiting(handle, outcome_rx) => {
                Self::await_creation(self.inner.id, handle, outcome_rx).await
            }
            AttachOutcome::Begun(handle) => {
                self.drive_creation(handle, request, fingerprint).await
            }
        }
    }

    /// Wait for an in-flight creation started by another caller.
    async fn await_creation(
        connection_id: ConnectionId,
        handle: SubscriptionHandle,
        mut outcome_rx: watch::Receiver<CreationOutcome>,
    ) -> Result<SubscriptionHandle, ApiError> {
        loop {
            let outcome = outcome_rx.borrow_and_update().clone();
            match outcome {
                CreationOutcome::Pending => {
                    if outcome_rx.changed().await.is_err() {
                        return Err(ApiError::Connection(ConnectionError::ConnectionLost {
                            connection_id,
                            reason: "subscription source vanished during creation".to_string(),
                        }));
                    }
                }
                CreationOutcome::Ready => return Ok(handle),
                CreationOutcome::Failed(error) => return Err(error),
            }
        }
    }

    /// Drive creation of a brand new source: send the subscribe request,
    /// then activate the source with its confirmation.
    async fn drive_creation(
        &self,
        handle: SubscriptionHandle,
        request: Value,
        fingerprint: RequestFingerprint,
    ) -> Result<SubscriptionHandle, ApiError> {
        let guard = CreationGuard {
            inner: self.inner.as_ref(),
            fingerprint: Some(fingerprint.clone()),
        };

        let mut subscribe_request = request;
        if let Some(object) = subscribe_request.as_object_mut() {
            object.insert("subscribe".to_string(), json!(1));
        }

        let result = self
            .inner
            .streaming_request(subscribe_request, fingerprint.clone())
            .await;
        guard.disarm();

        match result {
            Ok(confirmation) => {
                match self.inner.subscriptions.activate(&fingerprint, &confirmation) {
                    Activation::Streaming | Activation::Completed => Ok(handle),
                    Activation::Orphaned { subscription_id } => {
                        // Every handle was forgotten while the subscribe
                        // was in flight; cancel the remote stream.
                        if let Some(id) = subscription_id {
                            self.inner.spawn_forget(id);
                        }
                        Ok(handle)
                    }
                }
            }
            Err(error) => {
                self.inner.subscriptions.abort(&fingerprint, &error);
                Err(error)
            }
        }
    }

    /// Detach one handle; when it is the last one on its source, send the
    /// explicit cancel and return the remote response.
    ///
    /// # Errors
    ///
    /// Fails when the handle belongs to another connection or the cancel
    /// request itself fails.
    pub async fn forget(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<Option<InboundMessage>, ApiError> {
        if handle.connection_id() != self.inner.id {
            return Err(ApiError::Construction(ConstructionError::ForeignHandle));
        }
        match self.inner.subscriptions.detach(&handle) {
            Detach::LastHandle {
                subscription_id: Some(id),
            } => {
                let request = json!({"forget": id});
                let fingerprint = RequestFingerprint::of(&request);
                let response = self.inner.request_response(request, fingerprint).await?;
                Ok(Some(response))
            }
            Detach::LastHandle {
                subscription_id: None,
            }
            | Detach::Remaining
            | Detach::Gone => Ok(None),
        }
    }

    /// Cancel every source whose kind matches one of `kinds` (all sources
    /// when empty) and send one bulk cancel request.
    ///
    /// # Errors
    ///
    /// Fails when the bulk cancel request fails; local sources are
    /// terminated either way.
    pub async fn forget_all(&self, kinds: &[&str]) -> Result<InboundMessage, ApiError> {
        let removed = self.inner.subscriptions.terminate_kinds(kinds);
        let list: Vec<String> = if kinds.is_empty() {
            removed
        } else {
            kinds.iter().map(|&kind| kind.to_owned()).collect()
        };

        let request = json!({ "forget_all": list });
        let fingerprint = RequestFingerprint::of(&request);
        self.inner.request_response(request, fingerprint).await
    }

    /// Close the connection: cancel the pump, fail everything pending, and
    /// wait for shutdown to finish. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.pump.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        } else {
            // Never opened (or the pump already exited).
            self.inner.outbound.write().take();
            if self.state() != ConnectionState::Closed {
                self.inner.state_tx.send_replace(ConnectionState::Closed);
                self.inner
                    .emit(ConnectionEventKind::Disconnected { reason: None });
            }
        }
    }
}

impl ConnectionInner {
    /// Full request/response round trip through the correlator.
    async fn request_response(
        &self,
        mut request: Value,
        fingerprint: RequestFingerprint,
    ) -> Result<InboundMessage, ApiError> {
        let (req_id, receiver) = self.correlator.register(fingerprint);
        self.dispatch_outbound(req_id, &mut request)?;
        self.await_response(req_id, receiver).await
    }

    /// Like [`request_response`](Self::request_response), but records the
    /// correlation id with the subscription manager before anything hits
    /// the wire, so a streaming event can never outrun its route.
    async fn streaming_request(
        &self,
        mut request: Value,
        fingerprint: RequestFingerprint,
    ) -> Result<InboundMessage, ApiError> {
        let (req_id, receiver) = self.correlator.register(fingerprint.clone());
        self.subscriptions.record_request_id(&fingerprint, req_id);
        self.dispatch_outbound(req_id, &mut request)?;
        self.await_response(req_id, receiver).await
    }

    /// Stamp a registered correlation id onto the request and put the
    /// serialized frame on the wire. The pending entry is discarded when
    /// the request never reaches the wire.
    fn dispatch_outbound(&self, req_id: u64, request: &mut Value) -> Result<(), ApiError> {
        let Some(object) = request.as_object_mut() else {
            self.correlator.discard(req_id);
            return Err(ApiError::Construction(ConstructionError::PayloadNotAnObject));
        };
        object.insert("req_id".to_string(), json!(req_id));

        let frame = match serde_json::to_string(request) {
            Ok(frame) => frame,
            Err(error) => {
                self.correlator.discard(req_id);
                return Err(ApiError::Construction(ConstructionError::Serialization(
                    error.to_string(),
                )));
            }
        };

        if let Err(error) = self.enqueue(frame) {
            self.correlator.discard(req_id);
            return Err(error);
        }

        self.emit(ConnectionEventKind::RequestSent { req_id });
        tracing::debug!(connection = %self.id, req_id, "Request sent");
        Ok(())
    }

    /// Suspend until the pending request resolves. Dropping the returned
    /// future retires the correlation id so a late response cannot
    /// resurrect the call.
    async fn await_response(
        &self,
        req_id: u64,
        receiver: oneshot::Receiver<Result<InboundMessage, ApiError>>,
    ) -> Result<InboundMessage, ApiError> {
        let guard = RetireGuard {
            correlator: &self.correlator,
            req_id,
            armed: true,
        };
        let outcome = receiver.await;
        guard.disarm();

        outcome.map_or_else(
            |_| {
                Err(ApiError::Connection(ConnectionError::ConnectionLost {
                    connection_id: self.id,
                    reason: "connection closed before the response arrived".to_string(),
                }))
            },
            |result| result,
        )
    }

    fn enqueue(&self, frame: String) -> Result<(), ApiError> {
        let sender = self.outbound.read().clone();
        match sender {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(ApiError::Connection(ConnectionError::NotOpen(self.id))),
        }
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            connection_id: self.id,
            kind,
        };
        if event.kind.is_error() {
            let _ = self.errors_tx.send(event.clone());
        }
        let _ = self.events_tx.send(event);
    }

    /// Send a fire-and-forget cancel for a remote subscription id that no
    /// local source wants anymore.
    fn spawn_forget(self: &Arc<Self>, subscription_id: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let request = json!({"forget": subscription_id});
            let fingerprint = RequestFingerprint::of(&request);
            match inner.request_response(request, fingerprint).await {
                Ok(_) => tracing::debug!(connection = %inner.id, "Cancelled orphaned subscription"),
                Err(error) => tracing::debug!(
                    connection = %inner.id,
                    %error,
                    "Failed to cancel orphaned subscription"
                ),
            }
        });
    }

    /// Route one inbound frame: pending request, then subscription
    /// fan-out, else unmatched.
    fn dispatch(self: &Arc<Self>, text: &str) {
        let message: InboundMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(connection = %self.id, %error, "Discarding unparseable frame");
                return;
            }
        };

        if !self.config.middleware().before_dispatch(&message) {
            tracing::debug!(connection = %self.id, "Inbound message vetoed by middleware");
            return;
        }

        self.emit(ConnectionEventKind::MessageReceived {
            msg_type: message.msg_type.clone(),
        });

        if let Some(req_id) = message.req_id {
            match self.correlator.resolve(req_id, &message) {
                Resolution::Resolved {
                    fingerprint,
                    success,
                } => {
                    if success {
                        self.cache.store(&fingerprint, &message);
                    }
                    return;
                }
                Resolution::Retired { subscription_id } => {
                    // A confirmation for a call nobody is waiting on keeps
                    // the remote side streaming; cancel it.
                    if let Some(id) = subscription_id {
                        tracing::debug!(
                            connection = %self.id,
                            req_id,
                            "Late confirmation for a retired call; sending cancel"
                        );
                        self.spawn_forget(id);
                    }
                    return;
                }
                Resolution::NotPending => {}
            }
        }

        if let Some(fingerprint) = self.subscriptions.route_event(&message) {
            self.cache.store(&fingerprint, &message);
            return;
        }

        self.emit(ConnectionEventKind::Unmatched {
            req_id: message.req_id,
        });
        tracing::debug!(
            connection = %self.id,
            req_id = ?message.req_id,
            msg_type = ?message.msg_type,
            "Unmatched inbound message"
        );
    }

    /// Fail everything in flight after a session ended.
    fn fail_in_flight(&self, reason: &str) {
        let error = ApiError::Connection(ConnectionError::ConnectionLost {
            connection_id: self.id,
            reason: reason.to_string(),
        });
        self.correlator.fail_all(&error);
        self.subscriptions.fail_all(&error);
    }
}

/// Removes the pending entry when a caller abandons a suspended call.
struct RetireGuard<'a> {
    correlator: &'a RequestCorrelator,
    req_id: u64,
    armed: bool,
}

impl RetireGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RetireGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.correlator.retire(self.req_id);
        }
    }
}

/// Tears down a partially created source when the creating caller drops
/// its subscribe future mid-flight.
struct CreationGuard<'a> {
    inner: &'a ConnectionInner,
    fingerprint: Option<RequestFingerprint>,
}

impl CreationGuard<'_> {
    fn disarm(mut self) {
        self.fingerprint = None;
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if let Some(fingerprint) = self.fingerprint.take() {
            self.inner
                .subscriptions
                .abort(&fingerprint, &ApiError::Connection(ConnectionError::Abandoned));
        }
    }
}

// =============================================================================
// Message Pump
// =============================================================================

enum SessionEnd {
    Cancelled,
    Transport(TransportError),
}

/// Run the connection's pump across transport sessions until the
/// connection closes.
async fn run_pump(
    inner: Arc<ConnectionInner>,
    transport: Box<dyn Transport>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
) {
    let mut policy = ReconnectPolicy::new(
        inner.config.backoff(),
        inner.config.max_reconnect_attempts(),
    );
    let mut transport = transport;
    let mut outbound_rx = outbound_rx;

    loop {
        let (mut sink, mut stream) = transport.split();
        let end = run_session(&inner, sink.as_mut(), stream.as_mut(), &mut outbound_rx).await;

        // The session is over: stop accepting sends and fail everything
        // that was in flight. Subscriptions do not survive a reconnect.
        inner.outbound.write().take();
        let reason = match &end {
            SessionEnd::Cancelled => "connection closed by disconnect".to_string(),
            SessionEnd::Transport(error) => error.to_string(),
        };
        inner.fail_in_flight(&reason);
        let _ = sink.close().await;

        match end {
            SessionEnd::Cancelled => {
                inner.state_tx.send_replace(ConnectionState::Closed);
                inner.emit(ConnectionEventKind::Disconnected { reason: None });
                tracing::info!(connection = %inner.id, "Connection closed");
                return;
            }
            SessionEnd::Transport(error) => {
                tracing::warn!(connection = %inner.id, %error, "Transport failed");
                inner.emit(ConnectionEventKind::Disconnected {
                    reason: Some(error.to_string()),
                });

                if !inner.config.auto_reconnect() {
                    inner.state_tx.send_replace(ConnectionState::Closed);
                    return;
                }

                inner.state_tx.send_replace(ConnectionState::Reconnecting);
                match redial(&inner, &mut policy).await {
                    Redial::Connected(new_transport, new_outbound_rx) => {
                        transport = new_transport;
                        outbound_rx = new_outbound_rx;
                        policy.reset();
                        inner.state_tx.send_replace(ConnectionState::Open);
                        inner.emit(ConnectionEventKind::Reconnected);
                        tracing::info!(connection = %inner.id, "Reconnected");
                    }
                    Redial::Cancelled => {
                        inner.state_tx.send_replace(ConnectionState::Closed);
                        inner.emit(ConnectionEventKind::Disconnected { reason: None });
                        return;
                    }
                    Redial::Exhausted => {
                        inner.state_tx.send_replace(ConnectionState::Closed);
                        inner.emit(ConnectionEventKind::ReconnectExhausted);
                        tracing::error!(connection = %inner.id, "Reconnect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }
}

/// Drive one transport session until cancellation or transport failure.
async fn run_session(
    inner: &Arc<ConnectionInner>,
    sink: &mut dyn TransportSink,
    stream: &mut dyn TransportStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
) -> SessionEnd {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return SessionEnd::Cancelled,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(error) = sink.send(frame).await {
                        return SessionEnd::Transport(error);
                    }
                }
                // The sender side was replaced or dropped during teardown.
                None => return SessionEnd::Cancelled,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(text)) => inner.dispatch(&text),
                Some(Err(error)) => return SessionEnd::Transport(error),
                None => return SessionEnd::Transport(TransportError::Closed),
            },
        }
    }
}

enum Redial {
    Connected(Box<dyn Transport>, mpsc::UnboundedReceiver<String>),
    Cancelled,
    Exhausted,
}

/// Redial per the backoff schedule until success, cancellation, or
/// exhaustion.
async fn redial(inner: &Arc<ConnectionInner>, policy: &mut ReconnectPolicy) -> Redial {
    while let Some(delay) = policy.next_delay() {
        let attempt = policy.attempt_count();
        inner.emit(ConnectionEventKind::Reconnecting { attempt });
        tracing::info!(
            connection = %inner.id,
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting"
        );

        tokio::select! {
            () = inner.cancel.cancelled() => return Redial::Cancelled,
            () = tokio::time::sleep(delay) => {}
        }

        match inner.factory.connect(&inner.config).await {
            Ok(transport) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                *inner.outbound.write() = Some(outbound_tx);
                return Redial::Connected(transport, outbound_rx);
            }
            Err(error) => {
                tracing::warn!(connection = %inner.id, attempt, %error, "Reconnect attempt failed");
                inner.emit(ConnectionEventKind::ReconnectFailed {
                    attempt,
                    error: error.to_string(),
                });
            }
        }
    }
    Redial::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_open_accepts_traffic() {
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Connecting.is_open());
        assert!(!ConnectionState::Reconnecting.is_open());
        assert!(!ConnectionState::Closed.is_open());
    }

    #[test]
    fn error_events_are_classified() {
        assert!(
            ConnectionEventKind::Disconnected {
                reason: Some("transport closed by peer".to_string())
            }
            .is_error()
        );
        assert!(ConnectionEventKind::ReconnectExhausted.is_error());
        assert!(
            ConnectionEventKind::ReconnectFailed {
                attempt: 1,
                error: "refused".to_string()
            }
            .is_error()
        );
        assert!(!ConnectionEventKind::Disconnected { reason: None }.is_error());
        assert!(!ConnectionEventKind::Connected.is_error());
        assert!(!ConnectionEventKind::Reconnected.is_error());
    }
}
