//! Connection Configuration
//!
//! Per-connection settings with independent defaults, built through
//! [`ConnectionConfigBuilder`]. The endpoint and application id are
//! required; everything else defaults. Validation happens at build time so
//! an invalid endpoint surfaces as a [`ConstructionError`] before any wire
//! traffic.

use url::Url;

use crate::application::middleware::MiddlewareStack;
use crate::domain::message::DEFAULT_STREAM_KINDS;
use crate::error::ConstructionError;
use crate::infrastructure::connection::reconnect::BackoffSchedule;

/// Default language tag sent to the service.
const DEFAULT_LANG: &str = "EN";

/// Default cap on reconnect attempts.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Validated configuration for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    endpoint: String,
    app_id: String,
    lang: String,
    brand: String,
    auth_token: Option<String>,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    backoff: BackoffSchedule,
    stream_kinds: Vec<String>,
    middleware: MiddlewareStack,
    url: String,
}

impl ConnectionConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }

    /// The endpoint as configured.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The application id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The language tag.
    #[must_use]
    pub fn lang(&self) -> &str {
        &self.lang
    }

    /// The brand name, possibly empty.
    #[must_use]
    pub fn brand(&self) -> &str {
        &self.brand
    }

    /// Auth token for the owning application's authorization exchange.
    /// The engine stores it but does not interpret it.
    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Whether the connection reconnects automatically on transport loss.
    #[must_use]
    pub const fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    /// Reconnect attempt cap; zero means unlimited.
    #[must_use]
    pub const fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    /// Backoff schedule between reconnect attempts.
    #[must_use]
    pub const fn backoff(&self) -> BackoffSchedule {
        self.backoff
    }

    /// Stream kinds recognized for subscriptions, in lookup order.
    #[must_use]
    pub fn stream_kinds(&self) -> &[String] {
        &self.stream_kinds
    }

    /// The middleware chain.
    #[must_use]
    pub const fn middleware(&self) -> &MiddlewareStack {
        &self.middleware
    }

    /// The fully built WebSocket URL.
    #[must_use]
    pub fn websocket_url(&self) -> &str {
        &self.url
    }
}

/// Builder for [`ConnectionConfig`]; every option defaults independently.
///
/// # Example
///
/// ```rust
/// use tickmux::ConnectionConfig;
///
/// let config = ConnectionConfig::builder()
///     .endpoint("stream.example.com")
///     .app_id("1089")
///     .auto_reconnect(true)
///     .build()
///     .unwrap();
/// assert!(config.websocket_url().starts_with("wss://stream.example.com"));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    endpoint: Option<String>,
    app_id: Option<String>,
    lang: String,
    brand: String,
    auth_token: Option<String>,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    backoff: BackoffSchedule,
    stream_kinds: Vec<String>,
    middleware: MiddlewareStack,
}

impl ConnectionConfigBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            app_id: None,
            lang: DEFAULT_LANG.to_string(),
            brand: String::new(),
            auth_token: None,
            auto_reconnect: false,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff: BackoffSchedule::default(),
            stream_kinds: DEFAULT_STREAM_KINDS
                .iter()
                .map(|kind| (*kind).to_string())
                .collect(),
            middleware: MiddlewareStack::new(),
        }
    }

    /// Set the service endpoint. A bare host is normalized to `wss://`;
    /// an explicit `ws://` prefix is preserved for plaintext endpoints.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the application id (required).
    #[must_use]
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Set the language tag (defaults to `EN`).
    #[must_use]
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Set the brand name (defaults to empty).
    #[must_use]
    pub fn brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    /// Store an auth token for the owning application.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Enable or disable automatic reconnection (defaults to off).
    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Cap reconnect attempts; zero means unlimited (defaults to 5).
    #[must_use]
    pub const fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the backoff schedule between reconnect attempts.
    #[must_use]
    pub const fn backoff(mut self, schedule: BackoffSchedule) -> Self {
        self.backoff = schedule;
        self
    }

    /// Replace the recognized stream kinds (defaults to
    /// [`DEFAULT_STREAM_KINDS`]).
    #[must_use]
    pub fn stream_kinds(mut self, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stream_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Recognize an additional stream kind, appended after the defaults.
    #[must_use]
    pub fn stream_kind(mut self, kind: impl Into<String>) -> Self {
        self.stream_kinds.push(kind.into());
        self
    }

    /// Install a middleware chain (defaults to empty).
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareStack) -> Self {
        self.middleware = middleware;
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConstructionError`] when the endpoint or app id is
    /// missing, or the endpoint does not form a valid WebSocket URL.
    pub fn build(self) -> Result<ConnectionConfig, ConstructionError> {
        let endpoint = self.endpoint.ok_or(ConstructionError::MissingEndpoint)?;
        let app_id = self.app_id.ok_or(ConstructionError::MissingAppId)?;
        let url = build_url(&endpoint, &app_id, &self.lang, &self.brand)?;

        Ok(ConnectionConfig {
            endpoint,
            app_id,
            lang: self.lang,
            brand: self.brand,
            auth_token: self.auth_token,
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            backoff: self.backoff,
            stream_kinds: self.stream_kinds,
            middleware: self.middleware,
            url,
        })
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build and validate the full WebSocket URL for an endpoint.
fn build_url(
    endpoint: &str,
    app_id: &str,
    lang: &str,
    brand: &str,
) -> Result<String, ConstructionError> {
    // Preserve an explicit ws:// prefix; normalize everything else to wss://.
    let (scheme, host) = endpoint.strip_prefix("ws://").map_or_else(
        || {
            let host = endpoint
                .split_once("://")
                .map_or(endpoint, |(_, rest)| rest);
            ("wss", host)
        },
        |host| ("ws", host),
    );

    if host.is_empty() {
        return Err(ConstructionError::InvalidEndpoint(endpoint.to_string()));
    }

    let candidate = format!("{scheme}://{host}/stream/v3?app_id={app_id}&l={lang}&brand={brand}");
    let parsed =
        Url::parse(&candidate).map_err(|_| ConstructionError::InvalidEndpoint(endpoint.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(ConstructionError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ConnectionConfigBuilder {
        ConnectionConfig::builder()
            .endpoint("stream.example.com")
            .app_id("1089")
    }

    #[test]
    fn defaults_are_applied_independently() {
        let config = minimal().build().unwrap();

        assert_eq!(config.lang(), "EN");
        assert_eq!(config.brand(), "");
        assert!(config.auth_token().is_none());
        assert!(!config.auto_reconnect());
        assert_eq!(config.max_reconnect_attempts(), 5);
        assert_eq!(config.stream_kinds().len(), DEFAULT_STREAM_KINDS.len());
        assert!(config.middleware().is_empty());
    }

    #[test]
    fn bare_host_is_normalized_to_wss() {
        let config = minimal().build().unwrap();
        assert_eq!(
            config.websocket_url(),
            "wss://stream.example.com/stream/v3?app_id=1089&l=EN&brand="
        );
    }

    #[test]
    fn plaintext_ws_prefix_is_preserved() {
        let config = ConnectionConfig::builder()
            .endpoint("ws://localhost:8080")
            .app_id("1089")
            .build()
            .unwrap();
        assert!(config.websocket_url().starts_with("ws://localhost:8080/"));
    }

    #[test]
    fn foreign_schemes_are_rewritten_to_wss() {
        let config = ConnectionConfig::builder()
            .endpoint("https://stream.example.com")
            .app_id("1089")
            .build()
            .unwrap();
        assert!(config.websocket_url().starts_with("wss://stream.example.com/"));
    }

    #[test]
    fn missing_endpoint_is_a_construction_error() {
        let error = ConnectionConfig::builder().app_id("1089").build().unwrap_err();
        assert_eq!(error, ConstructionError::MissingEndpoint);
    }

    #[test]
    fn missing_app_id_is_a_construction_error() {
        let error = ConnectionConfig::builder()
            .endpoint("stream.example.com")
            .build()
            .unwrap_err();
        assert_eq!(error, ConstructionError::MissingAppId);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        let error = ConnectionConfig::builder()
            .endpoint("")
            .app_id("1089")
            .build()
            .unwrap_err();
        assert!(matches!(error, ConstructionError::InvalidEndpoint(_)));
    }

    #[test]
    fn lang_and_brand_flow_into_the_url() {
        let config = minimal().lang("FR").brand("acme").build().unwrap();
        assert!(config.websocket_url().ends_with("app_id=1089&l=FR&brand=acme"));
    }

    #[test]
    fn extra_stream_kinds_extend_the_default_set() {
        let config = minimal().stream_kind("exchange_rates").build().unwrap();
        assert!(
            config
                .stream_kinds()
                .iter()
                .any(|kind| kind == "exchange_rates")
        );
        assert!(config.stream_kinds().iter().any(|kind| kind == "ticks"));
    }
}
