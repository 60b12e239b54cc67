//! Configuration types shared by the engine and the `switchboard` binary.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration (a single stdio transport, no auth, no outbound target).

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub transports: Vec<TransportSettings>,
    pub auth: AuthSettings,
    pub pool: PoolConfig,
    pub session: SessionConfig,
    pub tools: ToolsConfig,
    pub outbound: Option<OutboundSettings>,
    pub reconnect: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            transports: vec![TransportSettings::Stdio],
            auth: AuthSettings::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
            tools: ToolsConfig::default(),
            outbound: None,
            reconnect: RetryConfig::default(),
        }
    }
}

impl Settings {
    /// Parse and validate settings from a TOML document.
    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> CoreResult<()> {
        if self.transports.is_empty() {
            return Err(CoreError::Config(
                "at least one transport must be configured".to_string(),
            ));
        }

        let stdio_count = self
            .transports
            .iter()
            .filter(|t| matches!(t, TransportSettings::Stdio))
            .count();
        if stdio_count > 1 {
            return Err(CoreError::Config(
                "only one stdio transport can be configured".to_string(),
            ));
        }

        if self.pool.max_size == 0 {
            return Err(CoreError::Config("pool.max_size must be at least 1".to_string()));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(CoreError::Config(
                "pool.acquire_timeout_ms must be positive".to_string(),
            ));
        }
        if self.session.idle_timeout_ms == 0 {
            return Err(CoreError::Config(
                "session.idle_timeout_ms must be positive".to_string(),
            ));
        }
        if self.tools.call_timeout_ms == 0 {
            return Err(CoreError::Config(
                "tools.call_timeout_ms must be positive".to_string(),
            ));
        }

        if self.auth.method == AuthMethod::Bearer
            && self.auth.token.as_deref().map_or(true, str::is_empty)
        {
            return Err(CoreError::Config(
                "auth.token is required when auth.method = \"bearer\"".to_string(),
            ));
        }

        if let Some(outbound) = &self.outbound {
            if outbound.url.trim().is_empty() {
                return Err(CoreError::Config("outbound.url cannot be empty".to_string()));
            }
        }

        Ok(())
    }
}

/// Server identity advertised during initialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "switchboard".to_string(),
        }
    }
}

/// One configured transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSettings {
    Stdio,
    Http(HttpSettings),
    Websocket(WebSocketSettings),
}

impl TransportSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http(_) => "http",
            Self::Websocket(_) => "websocket",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Listener address, e.g. `127.0.0.1:8080`. No listener when unset.
    pub bind: Option<String>,
    /// Path the listener accepts JSON-RPC posts on.
    pub path: String,
    /// Peer endpoint for outbound calls.
    pub remote_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            bind: None,
            path: "/mcp".to_string(),
            remote_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl HttpSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Listener address. No listener when unset.
    pub bind: Option<String>,
    /// Upgrade path on the listener.
    pub path: String,
    /// Peer endpoint (`ws://` or `wss://`) for the outbound duplex connection.
    pub remote_url: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            bind: None,
            path: "/ws".to_string(),
            remote_url: None,
            request_timeout_ms: 30_000,
        }
    }
}

impl WebSocketSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// How inbound HTTP and WebSocket callers authenticate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    None,
    Bearer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub method: AuthMethod,
    pub token: Option<String>,
}

impl AuthSettings {
    /// The token callers must present, if authentication is enabled.
    pub fn required_token(&self) -> Option<&str> {
        match self.method {
            AuthMethod::None => None,
            AuthMethod::Bearer => self.token.as_deref(),
        }
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Idle connections older than this are evicted instead of reused.
    pub idle_ttl_ms: u64,
    /// How long `acquire` waits in the queue before giving up.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_ttl_ms: 300_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30 * 60 * 1000,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Default per-call handler budget; tools may override it.
    pub call_timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl ToolsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Http,
    Websocket,
}

/// Peer that pooled outbound calls are sent to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundSettings {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub url: String,
    #[serde(default = "default_outbound_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_outbound_timeout_ms() -> u64 {
    30_000
}

impl OutboundSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Exponential backoff used by reconnect loops and the retry decorator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        std::cmp::min(backoff, Duration::from_millis(self.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();

        assert_eq!(settings.transports, vec![TransportSettings::Stdio]);
        assert_eq!(settings.pool.max_size, 10);
        assert_eq!(settings.session.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.tools.call_timeout(), Duration::from_secs(30));
        assert!(settings.outbound.is_none());
        assert_eq!(settings.auth.required_token(), None);
    }

    #[test]
    fn test_parse_full_document() {
        let content = r#"
            [server]
            name = "edge"

            [[transports]]
            type = "http"
            bind = "127.0.0.1:8080"

            [[transports]]
            type = "websocket"
            bind = "127.0.0.1:8081"
            request_timeout_ms = 1000

            [auth]
            method = "bearer"
            token = "secret"

            [pool]
            max_size = 4
            idle_ttl_ms = 1000

            [outbound]
            type = "websocket"
            url = "ws://127.0.0.1:9000/ws"
        "#;

        let settings = Settings::from_toml_str(content).unwrap();
        assert_eq!(settings.server.name, "edge");
        assert_eq!(settings.transports.len(), 2);
        match &settings.transports[0] {
            TransportSettings::Http(http) => {
                assert_eq!(http.bind.as_deref(), Some("127.0.0.1:8080"));
                assert_eq!(http.path, "/mcp");
            }
            other => panic!("expected http transport, got {:?}", other),
        }
        match &settings.transports[1] {
            TransportSettings::Websocket(ws) => {
                assert_eq!(ws.request_timeout(), Duration::from_secs(1));
                assert_eq!(ws.path, "/ws");
            }
            other => panic!("expected websocket transport, got {:?}", other),
        }
        assert_eq!(settings.auth.required_token(), Some("secret"));
        assert_eq!(settings.pool.max_size, 4);
        assert_eq!(settings.pool.acquire_timeout_ms, 5_000);

        let outbound = settings.outbound.unwrap();
        assert_eq!(outbound.kind, OutboundKind::Websocket);
        assert_eq!(outbound.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_bearer_requires_token() {
        let result = Settings::from_toml_str("[auth]\nmethod = \"bearer\"\n");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let result = Settings::from_toml_str("[pool]\nmax_size = 0\n");
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_duplicate_stdio_rejected() {
        let content = "[[transports]]\ntype = \"stdio\"\n[[transports]]\ntype = \"stdio\"\n";
        assert!(Settings::from_toml_str(content).is_err());
    }

    #[test]
    fn test_unknown_transport_type_rejected() {
        let content = "[[transports]]\ntype = \"carrier-pigeon\"\n";
        assert!(matches!(
            Settings::from_toml_str(content),
            Err(CoreError::Toml(_))
        ));
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let config = RetryConfig {
            max_backoff_ms: 500,
            ..Default::default()
        };

        assert_eq!(config.backoff_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_config_no_retry() {
        let config = RetryConfig::no_retry();

        assert_eq!(config.max_retries, 0);
        assert_eq!(config.initial_backoff_ms, 100);
    }
}
