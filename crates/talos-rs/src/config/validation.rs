//! Comprehensive configuration validation with detailed error reporting.
//!
//! Validation runs before a snapshot is published: a configuration that
//! fails here never becomes live. Errors block publication; warnings
//! (REPLACEMENT-model duplicates, suspicious-but-legal settings) are
//! logged and tolerated.

use crate::config::settings::Config;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Maximum middleware chain length per route.
pub const MAX_CHAIN_LENGTH: usize = 20;
/// Maximum number of registered middleware across all pools.
pub const MAX_REGISTERED: usize = 100;
/// Maximum length of any configured string field.
const MAX_STRING_LENGTH: usize = 1024;
/// Maximum edit distance for middleware-id suggestions.
const MAX_SUGGESTION_DISTANCE: usize = 3;

static MIDDLEWARE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static pattern"));

/// Result of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        ValidationResult {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

/// Configuration validator covering structure, cross-references,
/// security checks, and the middleware chain rules.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Performs full validation of a parsed configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::new();

        Self::validate_server(config, &mut result);
        Self::validate_upstreams(config, &mut result);
        Self::validate_routes(config, &mut result);
        Self::validate_middleware_pools(config, &mut result);
        Self::validate_middleware_references(config, &mut result);
        Self::validate_middleware_duplicates(config, &mut result);
        Self::validate_jwt(config, &mut result);

        Self::log_results(&result);
        result
    }

    fn validate_server(config: &Config, result: &mut ValidationResult) {
        let server = &config.server;
        if server.listen_port == 0 {
            result.add_error("server.listen_port must be between 1 and 65535".to_string());
        }
        if server.backlog == 0 || server.backlog > 65_535 {
            result.add_error("server.backlog must be between 1 and 65535".to_string());
        }
        if server.max_request_size == 0 || server.max_request_size > 1 << 30 {
            result.add_error("server.max_request_size must be between 1 and 1GiB".to_string());
        }
        if server.max_header_size == 0 || server.max_header_size > 1 << 20 {
            result.add_error("server.max_header_size must be between 1 and 1MiB".to_string());
        }
        if server.worker_threads > 1024 {
            result.add_error("server.worker_threads must not exceed 1024".to_string());
        }
        if server.tls_enabled {
            if server.tls_certificate_path.is_empty() {
                result.add_error("TLS enabled but tls_certificate_path is empty".to_string());
            }
            if server.tls_private_key_path.is_empty() {
                result.add_error("TLS enabled but tls_private_key_path is empty".to_string());
            }
            if server.tls_alpn_protocols.is_empty() {
                result.add_warning(
                    "TLS enabled with empty ALPN list; clients fall back to HTTP/1.1".to_string(),
                );
            }
        }
        Self::check_string("server.listen_address", &server.listen_address, result);
    }

    fn validate_upstreams(config: &Config, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (index, upstream) in config.upstreams.iter().enumerate() {
            if upstream.name.is_empty() {
                result.add_error(format!("upstream #{index}: name must not be empty"));
            }
            Self::check_string(&format!("upstream #{index} name"), &upstream.name, result);
            if !seen.insert(&upstream.name) {
                result.add_error(format!("duplicate upstream name: {}", upstream.name));
            }
            if upstream.backends.is_empty() {
                result.add_error(format!(
                    "upstream {}: at least one backend is required",
                    upstream.name
                ));
            }
            for backend in &upstream.backends {
                if backend.host.is_empty() {
                    result.add_error(format!(
                        "upstream {}: backend host must not be empty",
                        upstream.name
                    ));
                }
                Self::check_string(
                    &format!("upstream {} backend host", upstream.name),
                    &backend.host,
                    result,
                );
                if backend.port == 0 {
                    result.add_error(format!(
                        "upstream {}: backend {} port must be between 1 and 65535",
                        upstream.name, backend.host
                    ));
                }
                if backend.weight == 0 {
                    result.add_error(format!(
                        "upstream {}: backend {} weight must be greater than 0",
                        upstream.name, backend.host
                    ));
                }
            }
            if upstream.pool_size == 0 || upstream.pool_size > 10_000 {
                result.add_error(format!(
                    "upstream {}: pool_size must be between 1 and 10000",
                    upstream.name
                ));
            }
            if upstream.max_retries > 10 {
                result.add_error(format!(
                    "upstream {}: max_retries must not exceed 10",
                    upstream.name
                ));
            }
            let breaker = &upstream.circuit_breaker;
            if breaker.enabled {
                if breaker.failure_threshold == 0 {
                    result.add_error(format!(
                        "upstream {}: circuit_breaker.failure_threshold must be at least 1",
                        upstream.name
                    ));
                }
                if breaker.success_threshold == 0 {
                    result.add_error(format!(
                        "upstream {}: circuit_breaker.success_threshold must be at least 1",
                        upstream.name
                    ));
                }
                if breaker.window_ms == 0 {
                    result.add_error(format!(
                        "upstream {}: circuit_breaker.window_ms must be greater than 0",
                        upstream.name
                    ));
                }
                if breaker.catastrophic_threshold < breaker.failure_threshold {
                    result.add_warning(format!(
                        "upstream {}: catastrophic_threshold below failure_threshold makes the global hint fire first",
                        upstream.name
                    ));
                }
            }
        }
    }

    fn validate_routes(config: &Config, result: &mut ValidationResult) {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for (index, route) in config.routes.iter().enumerate() {
            let label = format!("route #{index} ({})", route.path);

            if !route.path.starts_with('/') {
                result.add_error(format!("{label}: path must start with '/'"));
            }
            Self::check_string(&format!("{label} path"), &route.path, result);
            Self::check_injection(&format!("{label} path"), &route.path, result);

            // A wildcard only makes sense as the final segment.
            if let Some(pos) = route.path.find('*') {
                if pos + 1 != route.path.len() || !route.path[..pos].ends_with('/') {
                    result.add_error(format!(
                        "{label}: wildcard must be the final path segment"
                    ));
                }
            }

            if let Err(message) = route.method_filter() {
                result.add_error(format!("{label}: {message}"));
            }

            if route.upstream.is_empty() {
                result.add_error(format!("{label}: upstream must not be empty"));
            } else if config.upstream(&route.upstream).is_none() {
                result.add_error(format!(
                    "{label}: references unknown upstream '{}'",
                    route.upstream
                ));
            }

            if let Some(rewrite) = &route.rewrite_path {
                if !rewrite.starts_with('/') {
                    result.add_error(format!("{label}: rewrite_path must start with '/'"));
                }
                Self::check_injection(&format!("{label} rewrite_path"), rewrite, result);
            }

            if let Some(timeout) = route.timeout {
                if timeout == 0 || timeout > 600_000 {
                    result.add_error(format!(
                        "{label}: timeout must be between 1 and 600000 ms"
                    ));
                }
            }

            if route.middleware.len() > MAX_CHAIN_LENGTH {
                result.add_error(format!(
                    "{label}: middleware chain length {} exceeds the maximum of {}",
                    route.middleware.len(),
                    MAX_CHAIN_LENGTH
                ));
            }

            if !seen.insert((route.method.clone(), route.path.clone())) {
                result.add_warning(format!(
                    "{label}: duplicate of an earlier route with the same method; priority decides"
                ));
            }
        }
    }

    fn validate_middleware_pools(config: &Config, result: &mut ValidationResult) {
        let pools = &config.middlewares;
        if pools.total_registered() > MAX_REGISTERED {
            result.add_error(format!(
                "{} registered middleware exceed the maximum of {}",
                pools.total_registered(),
                MAX_REGISTERED
            ));
        }
        for id in pools.all_ids() {
            if !MIDDLEWARE_ID.is_match(id) {
                result.add_error(format!(
                    "middleware id '{}' is invalid: ids match [A-Za-z0-9_-]{{1,64}}",
                    sanitize_for_log(id)
                ));
            }
        }
        for (id, settings) in &pools.rate_limit {
            if settings.requests_per_second == 0 {
                result.add_error(format!(
                    "rate_limit middleware '{id}': requests_per_second must be at least 1"
                ));
            }
            if settings.burst_size == 0 {
                result.add_error(format!(
                    "rate_limit middleware '{id}': burst_size must be at least 1"
                ));
            }
        }
        for (id, settings) in &pools.transform {
            for rule in &settings.path_rewrites {
                if !rule.pattern.is_empty() {
                    if let Err(error) = Regex::new(&rule.pattern) {
                        result.add_error(format!(
                            "transform middleware '{id}': invalid rewrite pattern: {error}"
                        ));
                    }
                }
            }
        }
    }

    fn validate_middleware_references(config: &Config, result: &mut ValidationResult) {
        for (index, route) in config.routes.iter().enumerate() {
            for id in &route.middleware {
                if !MIDDLEWARE_ID.is_match(id) {
                    result.add_error(format!(
                        "route #{index} ({}): middleware id '{}' is invalid: ids match [A-Za-z0-9_-]{{1,64}}",
                        route.path,
                        sanitize_for_log(id)
                    ));
                    continue;
                }
                if !config.middlewares.contains(id) {
                    let mut message = format!(
                        "route #{index} ({}): unknown middleware '{id}'",
                        route.path
                    );
                    let suggestions = suggest_similar(id, &config.middlewares.all_ids());
                    if !suggestions.is_empty() {
                        message.push_str(". Did you mean: ");
                        message.push_str(&suggestions.join(", "));
                    }
                    result.add_error(message);
                }
            }
        }
    }

    fn validate_middleware_duplicates(config: &Config, result: &mut ValidationResult) {
        for (index, route) in config.routes.iter().enumerate() {
            let mut types_seen: HashSet<&str> = HashSet::new();
            for id in &route.middleware {
                if let Some(kind) = config.middlewares.kind_of(id) {
                    if !types_seen.insert(kind) {
                        result.add_warning(format!(
                            "route #{index} ({}): multiple middleware of type '{kind}'; only the first will execute",
                            route.path
                        ));
                    }
                }
            }
        }
    }

    fn validate_jwt(config: &Config, result: &mut ValidationResult) {
        let jwt = &config.jwt;
        if !jwt.enabled {
            return;
        }
        if jwt.keys.is_empty() && jwt.jwks.is_none() {
            result.add_error(
                "jwt.enabled requires at least one static key or a jwks endpoint".to_string(),
            );
        }
        for (index, key) in jwt.keys.iter().enumerate() {
            match key.algorithm.as_str() {
                "HS256" => {
                    if key.secret.is_empty() {
                        result.add_error(format!("jwt key #{index}: HS256 requires a secret"));
                    } else if key.secret.len() < 32 {
                        result.add_warning(format!(
                            "jwt key #{index}: HS256 secret shorter than 32 characters"
                        ));
                    }
                }
                "RS256" | "ES256" => {
                    if key.public_key_path.is_empty() {
                        result.add_error(format!(
                            "jwt key #{index}: {} requires public_key_path",
                            key.algorithm
                        ));
                    }
                }
                other => {
                    result.add_error(format!(
                        "jwt key #{index}: unsupported algorithm '{}'",
                        sanitize_for_log(other)
                    ));
                }
            }
        }
        if jwt.clock_skew_seconds < 0 || jwt.clock_skew_seconds > 3600 {
            result.add_error("jwt.clock_skew_seconds must be between 0 and 3600".to_string());
        }
    }

    fn check_string(field: &str, value: &str, result: &mut ValidationResult) {
        if value.len() > MAX_STRING_LENGTH {
            result.add_error(format!(
                "{field}: exceeds the maximum length of {MAX_STRING_LENGTH}"
            ));
        }
    }

    fn check_injection(field: &str, value: &str, result: &mut ValidationResult) {
        if value.contains("..") {
            result.add_error(format!("{field}: path traversal sequence rejected"));
        }
        if value.contains('\0') || value.contains('\r') || value.contains('\n') {
            result.add_error(format!("{field}: control characters rejected"));
        }
        const METACHARACTERS: &[char] = &[';', '|', '&', '$', '`', '\'', '"', '<', '>'];
        if value.contains(METACHARACTERS) {
            result.add_error(format!("{field}: shell/SQL metacharacters rejected"));
        }
    }

    fn log_results(result: &ValidationResult) {
        if result.is_valid {
            info!(
                "configuration validation passed with {} warning(s)",
                result.warnings.len()
            );
        } else {
            for error in &result.errors {
                log::error!("validation error: {error}");
            }
        }
        for warning in &result.warnings {
            warn!("validation warning: {warning}");
        }
    }
}

/// Replaces control characters before a user-supplied value hits a log
/// line or an error message.
fn sanitize_for_log(value: &str) -> String {
    value
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

/// Bounded Levenshtein distance for typo suggestions.
fn edit_distance(a: &str, b: &str, cap: usize) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > cap {
        return cap + 1;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        let mut row_min = current[0];
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
            row_min = row_min.min(current[j + 1]);
        }
        if row_min > cap {
            return cap + 1;
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Suggests known ids within the edit-distance cap, closest first.
fn suggest_similar(typo: &str, known: &[&str]) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = known
        .iter()
        .filter_map(|candidate| {
            let distance = edit_distance(typo, candidate, MAX_SUGGESTION_DISTANCE);
            (distance <= MAX_SUGGESTION_DISTANCE).then_some((distance, *candidate))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, s)| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::parse_config;

    fn valid_config_json() -> String {
        r#"{
            "server": {"listen_port": 8080},
            "upstreams": [{
                "name": "api",
                "backends": [{"host": "10.0.0.1", "port": 8081}]
            }],
            "routes": [{"path": "/users/:id", "method": "GET", "upstream": "api"}]
        }"#
        .to_string()
    }

    #[test]
    fn valid_config_passes() {
        let config = parse_config(&valid_config_json()).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(result.is_valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn route_referencing_unknown_upstream_fails() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "upstream": "nope"}]
        }"#;
        let config = parse_config(json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("unknown upstream")));
    }

    #[test]
    fn invalid_method_tag_fails() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "method": "BREW", "upstream": "api"}]
        }"#;
        let config = parse_config(json).unwrap();
        assert!(!ConfigValidator::validate(&config).is_valid);
    }

    #[test]
    fn unknown_middleware_suggests_close_match() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "upstream": "api", "middleware": ["rate-limti"]}],
            "middlewares": {"rate_limit": {"rate-limit": {"requests_per_second": 10}}}
        }"#;
        let config = parse_config(json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(!result.is_valid);
        let error = result
            .errors
            .iter()
            .find(|e| e.contains("unknown middleware"))
            .unwrap();
        assert!(error.contains("Did you mean: rate-limit"), "{error}");
    }

    #[test]
    fn middleware_id_charset_is_enforced() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "upstream": "api", "middleware": ["../etc/passwd"]}]
        }"#;
        let config = parse_config(json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.contains("is invalid")));
    }

    #[test]
    fn injection_bait_in_paths_is_rejected() {
        for path in ["/a/../b", "/a;drop", "/a\r\nSet-Cookie: x"] {
            let json = format!(
                r#"{{
                    "upstreams": [{{"name": "api", "backends": [{{"host": "h"}}]}}],
                    "routes": [{{"path": {}, "upstream": "api"}}]
                }}"#,
                serde_json::to_string(path).unwrap()
            );
            let config = parse_config(&json).unwrap();
            assert!(
                !ConfigValidator::validate(&config).is_valid,
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn duplicate_middleware_type_warns_replacement() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "upstream": "api", "middleware": ["c1", "c2"]}],
            "middlewares": {"cors": {
                "c1": {"enabled": true},
                "c2": {"enabled": true}
            }}
        }"#;
        let config = parse_config(json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(result.is_valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("only the first will execute")));
    }

    #[test]
    fn chain_length_cap_is_enforced() {
        let ids: Vec<String> = (0..21).map(|i| format!("\"m{i}\"")).collect();
        let json = format!(
            r#"{{
                "upstreams": [{{"name": "api", "backends": [{{"host": "h"}}]}}],
                "routes": [{{"path": "/x", "upstream": "api", "middleware": [{}]}}]
            }}"#,
            ids.join(",")
        );
        let config = parse_config(&json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("chain length")));
    }

    #[test]
    fn jwt_enabled_requires_key_material() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/x", "upstream": "api"}],
            "jwt": {"enabled": true}
        }"#;
        let config = parse_config(json).unwrap();
        let result = ConfigValidator::validate(&config);
        assert!(!result.is_valid);
    }

    #[test]
    fn edit_distance_caps_out() {
        assert_eq!(edit_distance("abc", "abd", 3), 1);
        assert_eq!(edit_distance("rate-limti", "rate-limit", 3), 2);
        assert!(edit_distance("completely", "different!", 3) > 3);
    }

    #[test]
    fn wildcard_must_be_terminal() {
        let json = r#"{
            "upstreams": [{"name": "api", "backends": [{"host": "h"}]}],
            "routes": [{"path": "/a/*/b", "upstream": "api"}]
        }"#;
        let config = parse_config(json).unwrap();
        assert!(!ConfigValidator::validate(&config).is_valid);
    }
}
