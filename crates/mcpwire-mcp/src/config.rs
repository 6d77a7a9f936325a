//! Configuration for the client transport and the server handler.
//!
//! Everything deserializes from camelCase JSON with every field optional, so
//! a config file only needs to name what it changes.

use crate::backoff::ReconnectConfig;
use crate::error::{McpError, McpResult};
use crate::protocol::ServerCapabilities;
use crate::session::VersionPolicy;
use mcpwire_util::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default request timeout for the connect phase, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default number of events retained per stream for resumption.
pub const DEFAULT_MAX_RETAINED_EVENTS: usize = 512;

/// Default number of finished streams kept around for late resumption.
pub const DEFAULT_MAX_FINISHED_STREAMS: usize = 64;

/// Default keep-alive interval for open SSE streams.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

/// Streamable HTTP client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// The MCP endpoint (e.g., `https://mcp.example.com/mcp`).
    pub endpoint: String,
    /// Extra headers sent on every request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Strict mode: standalone-stream 5xx fails the connect, and
    /// notifications must be answered with 202.
    pub strict: bool,
    /// Whether to open the standalone GET stream after initialization.
    pub open_standalone_stream: bool,
    /// Timeout for establishing TCP/TLS connections.
    pub connect_timeout_ms: u64,
    /// Resumption backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            headers: HashMap::new(),
            auth_token: None,
            strict: false,
            open_standalone_stream: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn without_standalone_stream(mut self) -> Self {
        self.open_standalone_stream = false;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Check the endpoint is an absolute http(s) URL.
    pub fn validate(&self) -> McpResult<url::Url> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| {
            McpError::connection_failed(format!("invalid endpoint {:?}: {e}", self.endpoint))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(McpError::connection_failed(format!(
                "unsupported endpoint scheme {other:?}"
            ))),
        }
    }
}

/// Streamable HTTP server options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerOptions {
    /// Capabilities advertised in the `initialize` result.
    pub capabilities: ServerCapabilities,
    /// Handling of the `MCP-Protocol-Version` header.
    pub version_policy: VersionPolicy,
    /// Whether GET may open a standalone stream. When off, GET answers 405.
    pub standalone_stream: bool,
    /// Buffer server-initiated messages while no standalone stream is open.
    pub buffer_unsolicited: bool,
    /// Events retained per stream for `Last-Event-ID` resumption.
    pub max_retained_events: usize,
    /// Finished streams kept for late resumption.
    pub max_finished_streams: usize,
    /// SSE keep-alive interval. Zero disables keep-alives.
    pub keep_alive_secs: u64,
    /// Free-form instructions returned from `initialize`.
    pub instructions: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            capabilities: ServerCapabilities {
                logging: Some(serde_json::json!({})),
                ..Default::default()
            },
            version_policy: VersionPolicy::default(),
            standalone_stream: true,
            buffer_unsolicited: true,
            max_retained_events: DEFAULT_MAX_RETAINED_EVENTS,
            max_finished_streams: DEFAULT_MAX_FINISHED_STREAMS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            instructions: None,
        }
    }
}

impl ServerOptions {
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub log_level: LogLevel,
    pub client: ClientConfig,
    pub server: ServerOptions,
}

impl Config {
    /// Load a JSON config file.
    pub async fn load_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load `path` if given, defaults otherwise.
    pub async fn load_optional(path: Option<&Path>) -> McpResult<Self> {
        match path {
            Some(path) => Self::load_file(path).await,
            None => Ok(Self::default()),
        }
    }
}
