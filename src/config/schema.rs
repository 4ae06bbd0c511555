//! Configuration schema definitions.
//!
//! This module defines the complete policy model for the gateway.
//! All types derive Serde traits for deserialization from config files;
//! field names follow the camelCase JSON layout of `config.json`.

use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Identifier appended to forwarded `User-Agent` values when none is configured.
pub const DEFAULT_GATEWAY_NAME: &str = "api-gateway";

/// Default address the listener binds to.
pub const DEFAULT_BIND_ADDRESS: &str = ":1973";

/// Placeholder in backend URL templates replaced by the inbound request path.
pub const PATH_PLACEHOLDER: &str = "${path}";

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Identity metadata (name, version).
    pub api_gateway: GatewayIdentity,

    /// Vhost pattern → vhost definition, in declaration order.
    pub vhosts: IndexMap<String, Vhost>,

    /// Listener settings.
    pub listener: ListenerConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Identifier used in the forwarded `User-Agent` suffix.
    pub fn identifier(&self) -> &str {
        let name = self.api_gateway.name.trim();
        if name.is_empty() {
            DEFAULT_GATEWAY_NAME
        } else {
            name
        }
    }

    /// Returns `(any, all)`: whether any vhost carries TLS material and
    /// whether every vhost does. An empty vhost map is `(false, false)`.
    pub fn tls_coverage(&self) -> (bool, bool) {
        let any = self.vhosts.values().any(|v| v.tls.is_some());
        let all = !self.vhosts.is_empty() && self.vhosts.values().all(|v| v.tls.is_some());
        (any, all)
    }

    /// True when the listener should terminate TLS.
    pub fn uses_tls(&self) -> bool {
        self.tls_coverage().0
    }
}

/// Gateway identity metadata.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayIdentity {
    pub name: String,
    pub version: String,
}

/// A virtual host: endpoints plus optional CORS and TLS settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Vhost {
    /// CORS policy applied to every endpoint of this vhost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    pub endpoints: Vec<Endpoint>,

    /// Certificate material selected by SNI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMaterial>,
}

/// A routable (path, methods) pair bound to one backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Endpoint {
    /// Router path (`/users`, `/users/{id}`, `/files/{*rest}`).
    pub path: String,

    /// Allowed HTTP methods. Ignored for WebSocket endpoints.
    #[serde(default)]
    pub methods: Vec<String>,

    pub backend: Backend,

    /// Endpoint-level CORS policy, layered after the vhost policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<CorsPolicy>,

    /// Present when the endpoint relays WebSocket sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketPolicy>,
}

impl Endpoint {
    pub fn is_websocket(&self) -> bool {
        self.websocket.is_some()
    }
}

/// The upstream service a matched request is forwarded to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Backend {
    /// Target URL template; may contain `${path}`.
    pub url: String,

    /// Per-request timeout in seconds. `0` disables the timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Backend {
    /// Resolve the effective URL for an inbound request path.
    ///
    /// Every `${path}` occurrence is replaced by `path`; a template without
    /// the placeholder is returned unchanged.
    pub fn resolve_url(&self, path: &str) -> String {
        if self.url.contains(PATH_PLACEHOLDER) {
            self.url.replace(PATH_PLACEHOLDER, path)
        } else {
            self.url.clone()
        }
    }

    /// The configured timeout, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

/// Cross-origin resource sharing rules.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsPolicy {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds; `0` omits the header.
    pub max_age: u64,
}

/// WebSocket upgrade parameters for an endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WebSocketPolicy {
    /// Read buffer size in bytes; `0` keeps the library default.
    pub read_buffer_size: usize,
    /// Write buffer size in bytes; `0` keeps the library default.
    pub write_buffer_size: usize,
    /// Exact origins, or `*` for any origin.
    pub allowed_origins: Vec<String>,
}

impl WebSocketPolicy {
    /// Origin check performed before upgrading.
    ///
    /// `*` accepts any origin, including a missing header. Otherwise the
    /// `Origin` header must equal one of the listed values exactly.
    pub fn allows_origin(&self, origin: Option<&str>) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || Some(allowed.as_str()) == origin)
    }
}

/// PEM certificate chain and private key paths.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerConfig {
    /// Bind address (`:1973`, `127.0.0.1:8080`). The CLI flag wins.
    pub bind_address: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Prometheus scrape address; the exporter is off when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Json,
            log_level: "info".to_string(),
            metrics_address: None,
        }
    }
}
