//! Error Taxonomy
//!
//! Public error types surfaced by the engine. Four kinds exist:
//!
//! - [`TransportError`](crate::infrastructure::transport::TransportError):
//!   socket-level failures, handled internally by the reconnect state
//!   machine. Callers only see them directly from a failed dial.
//! - [`ConnectionError`]: the caller addressed an unknown or closed
//!   connection, or a pending call was torn down by a connection loss.
//! - [`ApiError::Remote`]: the service answered with an `error` object;
//!   the remote code and message are carried verbatim and never retried.
//! - [`ConstructionError`]: a request or configuration was malformed
//!   before anything touched the wire.
//!
//! Every suspended call resolves exactly once, either with a value or with
//! exactly one of these kinds.

use crate::domain::ConnectionId;
use crate::infrastructure::transport::TransportError;

/// Top-level error type returned by every fallible engine operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Socket-level failure (dialing, reading, or writing).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Connection lifecycle failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The service returned an `error` object for a request or
    /// subscription. Code and message are verbatim from the wire.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Remote error code, e.g. `"InvalidAppID"`.
        code: String,
        /// Human-readable remote error message.
        message: String,
    },

    /// The request or configuration was rejected before send.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

impl ApiError {
    /// Build a remote error from a wire code and message.
    #[must_use]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this error originated from the remote service.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Whether this error reports a connection-level failure.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Connection lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The given connection id is not registered with the manager.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    /// The connection exists but is not currently open for traffic.
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),

    /// The connection was lost while the operation was in flight.
    #[error("connection {connection_id} was lost: {reason}")]
    ConnectionLost {
        /// Connection that failed.
        connection_id: ConnectionId,
        /// Short description of the failure.
        reason: String,
    },

    /// The operation was abandoned by its own caller before it resolved.
    #[error("the call was abandoned before it resolved")]
    Abandoned,
}

/// Errors raised while validating a request or configuration, before any
/// wire traffic happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstructionError {
    /// No endpoint was configured.
    #[error("an endpoint is required to connect to the service")]
    MissingEndpoint,

    /// No application id was configured.
    #[error("an app_id is required to connect to the service")]
    MissingAppId,

    /// The configured endpoint does not parse as a WebSocket URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Requests must be JSON objects.
    #[error("request payload must be a JSON object")]
    PayloadNotAnObject,

    /// A subscribe request named no configured stream kind.
    #[error("no configured stream kind matches the request ({0})")]
    UnsupportedStreamKind(String),

    /// A subscription handle was routed to a connection it does not
    /// belong to.
    #[error("subscription handle belongs to a different connection")]
    ForeignHandle,

    /// The request could not be serialized for the wire.
    #[error("request could not be serialized: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_carries_code_and_message_verbatim() {
        let error = ApiError::remote("InvalidAppID", "Application ID is invalid.");
        assert!(error.is_remote());
        assert_eq!(
            error.to_string(),
            "remote error InvalidAppID: Application ID is invalid."
        );
    }

    #[test]
    fn connection_errors_render_the_connection_id() {
        let error = ApiError::Connection(ConnectionError::UnknownConnection(ConnectionId::new(7)));
        assert!(error.is_connection());
        assert_eq!(error.to_string(), "connection 7 is not registered");
    }

    #[test]
    fn transport_errors_convert_into_api_errors() {
        let error: ApiError = TransportError::Closed.into();
        assert!(matches!(error, ApiError::Transport(TransportError::Closed)));
    }
}
