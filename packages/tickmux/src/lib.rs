// Allow unwrap/expect in tests - tests should panic on unexpected errors
// Allow test-specific patterns and pedantic lints in test code
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Tickmux - Trading Data Stream Multiplexer
//!
//! A long-lived client engine that multiplexes many request/response
//! exchanges and many streaming subscriptions over one or more persistent
//! WebSocket connections to a remote trading-data service.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure engine logic, no I/O
//!   - `message`: the wire envelope (payloads stay opaque)
//!   - `fingerprint`: normalized request keys for dedup and caching
//!   - `cache`: last-value response cache
//!
//! - **Application**: Public surface
//!   - `client`: the `ApiClient` facade
//!   - `middleware`: send/receive/dispatch hook chain
//!
//! - **Infrastructure**: Adapters and connection machinery
//!   - `transport`: transport port + WebSocket adapter
//!   - `connection`: lifecycle, message pump, request correlation
//!   - `subscription`: subscription dedup and fan-out
//!   - `manager`: multi-connection registry
//!   - `config`: per-connection configuration
//!
//! # Data Flow
//!
//! ```text
//!                 ┌─────────────┐     ┌──────────────┐
//! ApiClient ─────►│ Connection  │────►│  WebSocket   │────► service
//!                 │  Manager    │     │  transport   │
//!                 └─────────────┘     └──────────────┘
//!                        │ per connection       │ pump (wire order)
//!                        ▼                      ▼
//!             correlator / subscriptions / cache
//! ```
//!
//! Each connection owns its correlator, subscription manager, and cache
//! exclusively; nothing is shared across connections except the manager's
//! registry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core engine types with no I/O dependencies.
pub mod domain;

/// Application layer - Public facade and extension points.
pub mod application;

/// Infrastructure layer - Adapters and connection machinery.
pub mod infrastructure;

/// Error taxonomy.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Application surface
pub use application::client::ApiClient;
pub use application::middleware::{Middleware, MiddlewareStack};

// Domain types
pub use domain::ConnectionId;
pub use domain::cache::{CacheEntry, ResponseCache};
pub use domain::fingerprint::RequestFingerprint;
pub use domain::message::{
    DEFAULT_STREAM_KINDS, InboundMessage, RemoteErrorBody, SubscriptionInfo,
};

// Errors
pub use error::{ApiError, ConnectionError, ConstructionError};

// Configuration
pub use infrastructure::config::{ConnectionConfig, ConnectionConfigBuilder};

// Connection machinery
pub use infrastructure::connection::reconnect::{BackoffSchedule, ReconnectPolicy};
pub use infrastructure::connection::{
    Connection, ConnectionEvent, ConnectionEventKind, ConnectionState,
};
pub use infrastructure::manager::ConnectionManager;
pub use infrastructure::subscription::{SourceUpdate, SubscriptionHandle, TerminationReason};

// Transport port (for custom adapters and test doubles)
pub use infrastructure::transport::{
    Transport, TransportError, TransportFactory, TransportSink, TransportStream, WebSocketFactory,
    WebSocketTransport,
};
