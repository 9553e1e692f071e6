//! Shared test doubles: a channel-backed transport and a scripted factory
//! standing in for the remote service.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use tickmux::{
    ApiClient, ConnectionConfig, Transport, TransportError, TransportFactory, TransportSink,
    TransportStream,
};

/// How long helpers wait before declaring the engine silent or stuck.
const WIRE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Channel Transport
// =============================================================================

/// In-memory transport: frames the engine sends surface on the paired
/// [`FakeRemote`]; frames the remote pushes surface to the engine.
pub struct ChannelTransport {
    sink_tx: mpsc::UnboundedSender<String>,
    stream_rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

impl Transport for ChannelTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSink>, Box<dyn TransportStream>) {
        (
            Box::new(ChannelSink { tx: self.sink_tx }),
            Box::new(ChannelStream {
                rx: self.stream_rx,
            }),
        )
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.tx
            .send(frame)
            .map_err(|_| TransportError::Write("remote hung up".to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl TransportStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

// =============================================================================
// Fake Remote
// =============================================================================

/// The test's side of one transport session.
pub struct FakeRemote {
    sent: mpsc::UnboundedReceiver<String>,
    push: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl FakeRemote {
    /// Await the next frame the engine put on the wire, parsed.
    pub async fn next_request(&mut self) -> Value {
        let frame = tokio::time::timeout(WIRE_TIMEOUT, self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("engine closed the transport");
        serde_json::from_str(&frame).expect("outbound frame is valid JSON")
    }

    /// Assert that the engine sends nothing for `quiet`.
    pub async fn expect_silence(&mut self, quiet: Duration) {
        match tokio::time::timeout(quiet, self.sent.recv()).await {
            Ok(Some(frame)) => panic!("unexpected outbound frame: {frame}"),
            Ok(None) | Err(_) => {}
        }
    }

    /// Push a raw inbound value to the engine.
    pub fn push_value(&self, value: &Value) {
        let _ = self.push.send(Ok(value.to_string()));
    }

    /// Push an unparseable inbound frame.
    pub fn push_garbage(&self) {
        let _ = self.push.send(Ok("not json".to_string()));
    }

    /// Respond to a request with a successful payload under `msg_type`.
    pub fn respond(&self, request: &Value, msg_type: &str, body: Value) {
        self.push_value(&build_response(request, msg_type, body, None));
    }

    /// Respond to a subscribe request, confirming with a subscription id.
    pub fn respond_subscription(
        &self,
        request: &Value,
        msg_type: &str,
        body: Value,
        subscription_id: &str,
    ) {
        self.push_value(&build_response(
            request,
            msg_type,
            body,
            Some(subscription_id),
        ));
    }

    /// Respond to a request with a remote error object.
    pub fn respond_error(&self, request: &Value, code: &str, message: &str) {
        let mut response = serde_json::Map::new();
        if let Some(req_id) = request.get("req_id") {
            response.insert("req_id".to_string(), req_id.clone());
        }
        response.insert(
            "error".to_string(),
            json!({"code": code, "message": message}),
        );
        self.push_value(&Value::Object(response));
    }

    /// Push a streaming event carrying a subscription id.
    pub fn push_event(&self, msg_type: &str, body: Value, subscription_id: &str) {
        let mut event = serde_json::Map::new();
        event.insert("msg_type".to_string(), json!(msg_type));
        event.insert(msg_type.to_string(), body);
        event.insert("subscription".to_string(), json!({"id": subscription_id}));
        self.push_value(&Value::Object(event));
    }

    /// Fail the transport with a read error.
    pub fn fail(&self) {
        let _ = self
            .push
            .send(Err(TransportError::Read("connection reset".to_string())));
    }

    /// Close the transport from the remote side.
    pub fn close(&self) {
        let _ = self.push.send(Err(TransportError::Closed));
    }
}

fn build_response(
    request: &Value,
    msg_type: &str,
    body: Value,
    subscription_id: Option<&str>,
) -> Value {
    let mut response = serde_json::Map::new();
    response.insert("msg_type".to_string(), json!(msg_type));
    response.insert(msg_type.to_string(), body);
    if let Some(req_id) = request.get("req_id") {
        response.insert("req_id".to_string(), req_id.clone());
    }
    if let Some(id) = subscription_id {
        response.insert("subscription".to_string(), json!({"id": id}));
    }
    Value::Object(response)
}

// =============================================================================
// Scripted Factory
// =============================================================================

/// Transport factory handing each dial's remote end to the test through a
/// channel. Dials can be made to fail for reconnect tests.
pub struct ScriptedFactory {
    remotes_tx: mpsc::UnboundedSender<FakeRemote>,
    fail_budget: AtomicU32,
    dials: AtomicU32,
}

impl ScriptedFactory {
    /// Make the next `count` dials fail with a handshake error.
    pub fn fail_next_dials(&self, count: u32) {
        self.fail_budget.store(count, Ordering::SeqCst);
    }

    /// Number of dial attempts made so far.
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_budget.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_budget.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Handshake("dial refused".to_string()));
        }

        let (sink_tx, sent_rx) = mpsc::unbounded_channel();
        let (push_tx, stream_rx) = mpsc::unbounded_channel();
        let _ = self.remotes_tx.send(FakeRemote {
            sent: sent_rx,
            push: push_tx,
        });
        Ok(Box::new(ChannelTransport { sink_tx, stream_rx }))
    }
}

/// Build a scripted factory and the channel its remotes arrive on.
pub fn scripted_factory() -> (Arc<ScriptedFactory>, mpsc::UnboundedReceiver<FakeRemote>) {
    let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
    (
        Arc::new(ScriptedFactory {
            remotes_tx,
            fail_budget: AtomicU32::new(0),
            dials: AtomicU32::new(0),
        }),
        remotes_rx,
    )
}

// =============================================================================
// Client Helpers
// =============================================================================

/// Install a test tracing subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A minimal valid configuration for tests.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .endpoint("stream.test.invalid")
        .app_id("1001")
        .build()
        .expect("test configuration is valid")
}

/// Connect a client through a scripted factory and hand back the first
/// session's remote end.
pub async fn connect_client() -> (
    ApiClient,
    FakeRemote,
    Arc<ScriptedFactory>,
    mpsc::UnboundedReceiver<FakeRemote>,
) {
    connect_client_with(test_config()).await
}

/// Like [`connect_client`], with a custom configuration.
pub async fn connect_client_with(
    config: ConnectionConfig,
) -> (
    ApiClient,
    FakeRemote,
    Arc<ScriptedFactory>,
    mpsc::UnboundedReceiver<FakeRemote>,
) {
    init_tracing();
    let (factory, mut remotes_rx) = scripted_factory();
    let dyn_factory: Arc<dyn TransportFactory> = Arc::clone(&factory) as Arc<dyn TransportFactory>;
    let client = ApiClient::with_factory(config, dyn_factory)
        .await
        .expect("client connects through the scripted factory");
    let remote = remotes_rx
        .recv()
        .await
        .expect("factory produced a session");
    (client, remote, factory, remotes_rx)
}
