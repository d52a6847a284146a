//! Configuration schema for the gateway.
//!
//! The JSON file is deserialized with serde; unknown keys are ignored
//! and missing keys receive the documented defaults, so a minimal
//! config stays minimal. Validation (cross-references, ranges, string
//! caps) lives in [`crate::config::validation`] and must pass before a
//! snapshot is published.

use crate::gateway::circuit_breaker::CircuitBreakerConfig;
use crate::gateway::load_balancer::LoadBalancingPolicy;
use crate::models::error::GatewayError;
use crate::models::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Global server settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerSettings {
    /// Worker count; 0 auto-detects the CPU count.
    pub worker_threads: u32,
    pub listen_address: String,
    pub listen_port: u16,
    pub backlog: u32,

    /// Timeouts in milliseconds.
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub idle_timeout: u64,
    pub shutdown_timeout: u64,

    pub max_connections: u32,
    pub max_request_size: u32,
    pub max_header_size: u32,

    pub tls_enabled: bool,
    pub tls_certificate_path: String,
    pub tls_private_key_path: String,
    /// ALPN protocols in server preference order.
    pub tls_alpn_protocols: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            worker_threads: 0,
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            backlog: 128,
            read_timeout: 60_000,
            write_timeout: 60_000,
            idle_timeout: 300_000,
            shutdown_timeout: 30_000,
            max_connections: 10_000,
            max_request_size: 1_048_576,
            max_header_size: 8_192,
            tls_enabled: false,
            tls_certificate_path: String::new(),
            tls_private_key_path: String::new(),
            tls_alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
        }
    }
}

impl ServerSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }
}

/// One backend inside an upstream.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendSettings {
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_backend_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    /// Seconds between health checks.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u32,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u32,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

fn default_backend_port() -> u16 {
    80
}
fn default_weight() -> u32 {
    1
}
fn default_backend_max_connections() -> u32 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_health_check_interval() -> u32 {
    30
}
fn default_health_check_timeout() -> u32 {
    5
}
fn default_health_check_path() -> String {
    "/health".to_string()
}

/// Embedded circuit-breaker settings for an upstream's backends.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Time Open before the next request probes recovery, milliseconds.
    pub timeout_ms: u64,
    /// Sliding failure window width, milliseconds.
    pub window_ms: u64,
    pub enable_global_hints: bool,
    pub catastrophic_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            window_ms: 10_000,
            enable_global_hints: true,
            catastrophic_threshold: 20,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            timeout: Duration::from_millis(self.timeout_ms),
            window: Duration::from_millis(self.window_ms),
            enable_global_hints: self.enable_global_hints,
            catastrophic_threshold: self.catastrophic_threshold,
        }
    }
}

/// A named group of backends.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamSettings {
    pub name: String,
    pub backends: Vec<BackendSettings>,
    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Milliseconds between retry attempts.
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Seconds an idle pooled connection may live.
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: u32,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

fn default_max_retries() -> u32 {
    2
}
fn default_retry_timeout() -> u64 {
    1000
}
fn default_pool_size() -> u32 {
    100
}
fn default_pool_idle_timeout() -> u32 {
    60
}

/// One route mapping a path pattern onto an upstream.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteSettings {
    /// Path pattern: literals, `:param` segments, trailing `*` wildcard.
    pub path: String,
    /// Restricting method; empty matches any method.
    #[serde(default)]
    pub method: String,
    pub upstream: String,
    #[serde(default)]
    pub handler_id: String,
    #[serde(default)]
    pub priority: u32,

    /// Optional rewrite applied to the path before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_path: Option<String>,
    /// Per-route upstream timeout override, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Ordered middleware ids from the pools.
    #[serde(default)]
    pub middleware: Vec<String>,

    /// Scopes the caller's token must carry (authorization middleware).
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Roles the caller's token must carry.
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// true = AND semantics (all scopes), false = OR (any scope).
    #[serde(default)]
    pub require_all_scopes: bool,
}

impl RouteSettings {
    /// The effective handler id: explicit, or the path itself.
    pub fn effective_handler_id(&self) -> &str {
        if self.handler_id.is_empty() {
            &self.path
        } else {
            &self.handler_id
        }
    }

    /// Parses the method tag; `Ok(None)` means any method.
    pub fn method_filter(&self) -> Result<Option<Method>, String> {
        if self.method.is_empty() {
            return Ok(None);
        }
        Method::parse(&self.method)
            .map(Some)
            .ok_or_else(|| format!("invalid HTTP method: {}", self.method))
    }
}

/// CORS middleware settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CorsSettings {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u32,
}

impl Default for CorsSettings {
    fn default() -> Self {
        CorsSettings {
            enabled: false,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec!["*".to_string()],
            allow_credentials: false,
            max_age: 86_400,
        }
    }
}

/// Rate-limiting settings (token bucket per key).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
    /// Bucket key: `client_ip` or `header:<Name>`.
    pub key: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            enabled: false,
            requests_per_second: 100,
            burst_size: 200,
            key: "client_ip".to_string(),
        }
    }
}

/// Static bearer-token authentication.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub header: String,
    pub valid_tokens: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            enabled: false,
            auth_type: "bearer".to_string(),
            header: "Authorization".to_string(),
            valid_tokens: Vec::new(),
        }
    }
}

/// One JWT verification key.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JwtKeySettings {
    /// "RS256", "ES256" or "HS256".
    pub algorithm: String,
    #[serde(default)]
    pub key_id: String,
    /// PEM file for the asymmetric algorithms.
    #[serde(default)]
    pub public_key_path: String,
    /// Base64-encoded secret for HS256.
    #[serde(default, skip_serializing)]
    pub secret: String,
}

/// JWKS endpoint settings (the fetcher itself is an external
/// collaborator; the core consumes its snapshots).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JwksSettings {
    pub url: String,
    #[serde(default = "default_jwks_refresh")]
    pub refresh_interval_seconds: u32,
    #[serde(default = "default_jwks_timeout")]
    pub timeout_seconds: u32,
    #[serde(default = "default_jwks_retry_max")]
    pub retry_max: u32,
    #[serde(default = "default_jwks_circuit_breaker")]
    pub circuit_breaker_seconds: u32,
}

fn default_jwks_refresh() -> u32 {
    3600
}
fn default_jwks_timeout() -> u32 {
    10
}
fn default_jwks_retry_max() -> u32 {
    3
}
fn default_jwks_circuit_breaker() -> u32 {
    300
}

/// JWT authentication settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JwtSettings {
    pub enabled: bool,
    pub header: String,
    pub scheme: String,
    pub keys: Vec<JwtKeySettings>,
    pub jwks: Option<JwksSettings>,

    pub require_exp: bool,
    pub require_sub: bool,
    pub allowed_issuers: Vec<String>,
    pub allowed_audiences: Vec<String>,
    /// Tolerance for exp/nbf checks, seconds.
    pub clock_skew_seconds: i64,

    /// Validated-token cache entries per worker.
    pub cache_capacity: usize,
    pub cache_enabled: bool,

    /// Revoked token ids (jti).
    pub revoked_jtis: Vec<String>,
}

impl Default for JwtSettings {
    fn default() -> Self {
        JwtSettings {
            enabled: false,
            header: "Authorization".to_string(),
            scheme: "Bearer".to_string(),
            keys: Vec::new(),
            jwks: None,
            require_exp: true,
            require_sub: false,
            allowed_issuers: Vec::new(),
            allowed_audiences: Vec::new(),
            clock_skew_seconds: 60,
            cache_capacity: 10_000,
            cache_enabled: true,
            revoked_jtis: Vec::new(),
        }
    }
}

/// Header mutation rule for the transform middleware.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    Add,
    Set,
    Remove,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeaderRule {
    pub op: TransformOp,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueryRule {
    pub op: TransformOp,
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Path rewrite: prefix strip first, then an optional regex rewrite.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PathRewriteRule {
    pub strip_prefix: String,
    pub pattern: String,
    pub replacement: String,
}

/// Transform middleware settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TransformSettings {
    pub path_rewrites: Vec<PathRewriteRule>,
    pub request_headers: Vec<HeaderRule>,
    pub response_headers: Vec<HeaderRule>,
    pub query: Vec<QueryRule>,
}

/// Compression middleware settings (negotiation surface only; codecs
/// are injected).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompressionSettings {
    pub enabled: bool,
    /// Bodies below this size are not worth compressing.
    pub min_size: usize,
    /// Content types eligible for compression.
    pub compressible_types: Vec<String>,
    /// Paths excluded for BREACH mitigation.
    pub breach_sensitive_paths: Vec<String>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        CompressionSettings {
            enabled: false,
            min_size: 1024,
            compressible_types: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "application/xml".to_string(),
            ],
            breach_sensitive_paths: Vec::new(),
        }
    }
}

/// Named middleware pools referenced by route `middleware` lists.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MiddlewarePools {
    pub rate_limit: HashMap<String, RateLimitSettings>,
    pub cors: HashMap<String, CorsSettings>,
    pub transform: HashMap<String, TransformSettings>,
    pub compression: HashMap<String, CompressionSettings>,
}

impl MiddlewarePools {
    /// All pool ids, used for existence checks and fuzzy suggestions.
    pub fn all_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        ids.extend(self.rate_limit.keys().map(|s| s.as_str()));
        ids.extend(self.cors.keys().map(|s| s.as_str()));
        ids.extend(self.transform.keys().map(|s| s.as_str()));
        ids.extend(self.compression.keys().map(|s| s.as_str()));
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rate_limit.contains_key(id)
            || self.cors.contains_key(id)
            || self.transform.contains_key(id)
            || self.compression.contains_key(id)
    }

    /// The type tag of a pool id, when it exists.
    pub fn kind_of(&self, id: &str) -> Option<&'static str> {
        if self.rate_limit.contains_key(id) {
            Some("rate_limit")
        } else if self.cors.contains_key(id) {
            Some("cors")
        } else if self.transform.contains_key(id) {
            Some("transform")
        } else if self.compression.contains_key(id) {
            Some("compression")
        } else {
            None
        }
    }

    pub fn total_registered(&self) -> usize {
        self.rate_limit.len() + self.cors.len() + self.transform.len() + self.compression.len()
    }
}

/// Logging settings (sink rotation happens outside the core).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_requests: bool,
    pub log_responses: bool,
    pub exclude_paths: Vec<String>,
    pub rotation: LogRotationSettings,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            format: "text".to_string(),
            output: String::new(),
            log_requests: true,
            log_responses: false,
            exclude_paths: Vec::new(),
            rotation: LogRotationSettings::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogRotationSettings {
    pub max_size_mb: u32,
    pub max_files: u32,
}

impl Default for LogRotationSettings {
    fn default() -> Self {
        LogRotationSettings {
            max_size_mb: 100,
            max_files: 10,
        }
    }
}

/// Metrics settings (the Prometheus text surface is external).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
    pub format: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        MetricsSettings {
            enabled: true,
            port: 9090,
            path: "/metrics".to_string(),
            format: "prometheus".to_string(),
        }
    }
}

/// The complete gateway configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub routes: Vec<RouteSettings>,
    pub upstreams: Vec<UpstreamSettings>,

    /// Global middleware defaults applied to every route.
    pub cors: CorsSettings,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
    pub jwt: JwtSettings,

    /// Named pools referenced by route middleware lists.
    pub middlewares: MiddlewarePools,

    pub logging: LoggingSettings,
    pub metrics: MetricsSettings,

    pub version: String,
    pub description: Option<String>,
}

impl Config {
    /// Finds an upstream definition by name.
    pub fn upstream(&self, name: &str) -> Option<&UpstreamSettings> {
        self.upstreams.iter().find(|u| u.name == name)
    }

    /// Worker count with CPU auto-detection for 0.
    pub fn effective_workers(&self) -> usize {
        if self.server.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.server.worker_threads as usize
        }
    }
}

/// Parses a configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<Config, GatewayError> {
    serde_json::from_str(json).map_err(|e| GatewayError::ConfigInvalid(e.to_string()))
}

/// Loads a configuration file from disk.
pub fn load_config(path: &str) -> Result<Config, GatewayError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::ConfigInvalid(format!("cannot read {path}: {e}")))?;
    parse_config(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(r#"{"version": "1.0"}"#).unwrap();
        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.tls_alpn_protocols, vec!["h2", "http/1.1"]);
        assert_eq!(config.server.max_request_size, 1_048_576);
        assert!(config.routes.is_empty());
        assert!(!config.cors.enabled);
        assert_eq!(config.rate_limit.requests_per_second, 100);
        assert_eq!(config.jwt.clock_skew_seconds, 60);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let config = parse_config(r#"{"version": "1.0", "experimental_flag": true}"#).unwrap();
        assert_eq!(config.version, "1.0");
    }

    #[test]
    fn full_route_and_upstream_parse() {
        let json = r#"{
            "upstreams": [{
                "name": "api",
                "backends": [
                    {"host": "10.0.0.1", "port": 8081, "weight": 2},
                    {"host": "10.0.0.2"}
                ],
                "load_balancing": "least_connections",
                "circuit_breaker": {"failure_threshold": 3}
            }],
            "routes": [{
                "path": "/users/:id",
                "method": "GET",
                "upstream": "api",
                "handler_id": "get_user",
                "priority": 10,
                "middleware": ["edge-cors"]
            }],
            "middlewares": {
                "cors": {"edge-cors": {"enabled": true, "allowed_origins": ["https://app.example"]}}
            }
        }"#;
        let config = parse_config(json).unwrap();

        let upstream = config.upstream("api").unwrap();
        assert_eq!(upstream.backends.len(), 2);
        assert_eq!(upstream.backends[0].weight, 2);
        assert_eq!(upstream.backends[1].port, 80);
        assert_eq!(upstream.load_balancing, LoadBalancingPolicy::LeastConnections);
        assert_eq!(upstream.circuit_breaker.failure_threshold, 3);
        assert_eq!(upstream.circuit_breaker.success_threshold, 2);

        let route = &config.routes[0];
        assert_eq!(route.method_filter().unwrap(), Some(Method::Get));
        assert_eq!(route.effective_handler_id(), "get_user");
        assert!(config.middlewares.contains("edge-cors"));
        assert_eq!(config.middlewares.kind_of("edge-cors"), Some("cors"));
    }

    #[test]
    fn handler_id_defaults_to_path() {
        let json = r#"{"routes": [{"path": "/x", "upstream": "u"}]}"#;
        let config = parse_config(json).unwrap();
        assert_eq!(config.routes[0].effective_handler_id(), "/x");
        assert!(config.routes[0].method_filter().unwrap().is_none());
    }

    #[test]
    fn invalid_method_tag_is_reported() {
        let json = r#"{"routes": [{"path": "/x", "method": "FETCH", "upstream": "u"}]}"#;
        let config = parse_config(json).unwrap();
        assert!(config.routes[0].method_filter().is_err());
    }

    #[test]
    fn malformed_json_is_config_invalid() {
        let result = parse_config("{not json");
        assert!(matches!(result, Err(GatewayError::ConfigInvalid(_))));
    }
}
