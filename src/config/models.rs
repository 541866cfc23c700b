//! Configuration data structures for Rampart.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and
//! are deserialized once at startup. Every section carries defaults so that a
//! minimal file only needs the listen address, the upstream services and the
//! route table. Durations are expressed as integer seconds / milliseconds and
//! exposed as [`Duration`] through accessor methods so the hot path never parses
//! anything.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_gateway_name() -> String {
    "rampart".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

/// A single backend service the gateway forwards traffic to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamServiceConfig {
    /// Base URL, e.g. `http://combat-service:8081`
    pub base_url: String,
    /// Path probed by the aggregate health report (never by the breaker)
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first transport failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl UpstreamServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            health_path: default_health_path(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Path prefix → upstream service mapping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
    /// Remove the matched prefix before appending the path to the base URL
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Sliding-window per-client rate limiting.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: u32,
    pub window_secs: u64,
    pub block_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 1000,
            window_secs: 60,
            block_secs: 900,
            cleanup_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Per-upstream circuit breaker policy (shared by all services).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects traffic before probing
    pub open_interval_secs: u64,
    /// Interval of the background Open → HalfOpen recovery sweep
    pub sweep_interval_secs: u64,
    /// Concurrent probes allowed while half-open (0 = unlimited)
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_interval_secs: 60,
            sweep_interval_secs: 30,
            half_open_max_probes: 0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_interval(&self) -> Duration {
        Duration::from_secs(self.open_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Outbound proxy behaviour shared across services.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Backoff unit; attempt `n` waits `n * retry_backoff_ms` before retrying
    pub retry_backoff_ms: u64,
    /// Inbound bodies are buffered (for replay on retry) up to this size
    pub max_request_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 100,
            max_request_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Server lifecycle and global request limits.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    /// Upper bound on total latency of one request, retries included
    pub request_timeout_secs: u64,
    /// Drain deadline used on graceful shutdown
    pub shutdown_timeout_secs: u64,
    /// Optional admission gate on concurrent in-flight requests
    pub max_in_flight: Option<usize>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            max_in_flight: None,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Which authentication adapter guards non-public routes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Every request is admitted as anonymous
    #[default]
    None,
    /// A non-empty `Authorization: Bearer` credential is required; verification
    /// of the token itself is left to the upstream services
    Bearer,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Path prefixes that skip authentication (login, registration, ...)
    pub public_prefixes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::None,
            public_prefixes: vec!["/api/v1/auth".to_string()],
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// `*` reflects any caller origin
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// TLS configuration via a PEM encoded certificate chain and private key.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Value of the gateway marker header
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,
    pub services: BTreeMap<String, UpstreamServiceConfig>,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            gateway_name: default_gateway_name(),
            services: BTreeMap::new(),
            routes: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            proxy: ProxyConfig::default(),
            server: ServerSettings::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            tls: None,
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    gateway_name: Option<String>,
    services: BTreeMap<String, UpstreamServiceConfig>,
    routes: Vec<RouteConfig>,
    rate_limit: Option<RateLimitConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    proxy: Option<ProxyConfig>,
    server: Option<ServerSettings>,
    auth: Option<AuthConfig>,
    cors: Option<CorsConfig>,
    tls: Option<TlsConfig>,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    pub fn gateway_name(mut self, name: impl Into<String>) -> Self {
        self.gateway_name = Some(name.into());
        self
    }

    /// Register an upstream service under `name`
    pub fn service(mut self, name: impl Into<String>, config: UpstreamServiceConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    /// Route every path starting with `prefix` to `service`
    pub fn route(mut self, prefix: impl Into<String>, service: impl Into<String>) -> Self {
        self.routes.push(RouteConfig {
            prefix: prefix.into(),
            service: service.into(),
            strip_prefix: false,
        });
        self
    }

    /// Like [`Self::route`], but the prefix is removed before forwarding
    pub fn stripped_route(mut self, prefix: impl Into<String>, service: impl Into<String>) -> Self {
        self.routes.push(RouteConfig {
            prefix: prefix.into(),
            service: service.into(),
            strip_prefix: true,
        });
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn proxy(mut self, config: ProxyConfig) -> Self {
        self.proxy = Some(config);
        self
    }

    pub fn server(mut self, config: ServerSettings) -> Self {
        self.server = Some(config);
        self
    }

    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.auth = Some(config);
        self
    }

    pub fn cors(mut self, config: CorsConfig) -> Self {
        self.cors = Some(config);
        self
    }

    /// Set TLS configuration with certificate paths
    pub fn tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        let listen_addr = self
            .listen_addr
            .ok_or_else(|| "listen_addr is required".to_string())?;

        if self.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }

        Ok(ServerConfig {
            listen_addr,
            gateway_name: self.gateway_name.unwrap_or_else(default_gateway_name),
            services: self.services,
            routes: self.routes,
            rate_limit: self.rate_limit.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            proxy: self.proxy.unwrap_or_default(),
            server: self.server.unwrap_or_default(),
            auth: self.auth.unwrap_or_default(),
            cors: self.cors.unwrap_or_default(),
            tls: self.tls,
        })
    }
}
