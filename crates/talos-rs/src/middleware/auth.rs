//! JWT authentication middleware.
//!
//! Extracts a bearer token (or the `token` query parameter for
//! WebSocket upgrades, where browsers cannot set headers), validates
//! the signature against the merged key set (static config keys plus
//! the latest JWKS snapshot), checks exp/nbf with clock-skew tolerance
//! and optional issuer/audience/revocation rules, and caches successful
//! validations per worker. Failures stop the pipeline with a 401 and a
//! deliberately generic body.

use crate::config::settings::{AuthSettings, JwtSettings};
use crate::gateway::pipeline::{Middleware, MiddlewareKind, MiddlewareResult, RequestContext};
use crate::models::error::GatewayError;
use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One verification key with its routing metadata.
pub struct VerificationKey {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub key: DecodingKey,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl VerificationKey {
    /// Builds a key for an RSA public key delivered as JWKS components
    /// (base64url modulus and exponent). This is the surface the JWKS
    /// fetcher collaborator feeds.
    pub fn from_rsa_components(
        key_id: impl Into<String>,
        modulus: &str,
        exponent: &str,
    ) -> Result<Self, GatewayError> {
        let key = DecodingKey::from_rsa_components(modulus, exponent)
            .map_err(|e| GatewayError::ConfigInvalid(format!("invalid JWKS key: {e}")))?;
        Ok(VerificationKey {
            key_id: key_id.into(),
            algorithm: Algorithm::RS256,
            key,
        })
    }
}

/// An immutable set of keys from one JWKS fetch.
#[derive(Debug, Default)]
pub struct JwksSnapshot {
    pub keys: Vec<VerificationKey>,
}

/// Shared JWKS key store, published with the same atomic-swap pattern
/// as the configuration. The fetcher (an external collaborator) builds
/// snapshots; every worker reads the latest on each validation.
pub struct JwksKeyStore {
    current: ArcSwap<JwksSnapshot>,
}

impl std::fmt::Debug for JwksKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksKeyStore")
            .field("keys", &self.get().keys.len())
            .finish()
    }
}

impl Default for JwksKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JwksKeyStore {
    pub fn new() -> Self {
        JwksKeyStore {
            current: ArcSwap::from_pointee(JwksSnapshot::default()),
        }
    }

    pub fn publish(&self, snapshot: JwksSnapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn get(&self) -> Arc<JwksSnapshot> {
        self.current.load_full()
    }
}

/// Claims the gateway inspects. Everything else passes through opaque.
#[derive(Debug, Clone, serde::Deserialize)]
struct Claims {
    sub: Option<String>,
    exp: Option<i64>,
    jti: Option<String>,
    scope: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// A cached successful validation.
#[derive(Debug, Clone)]
struct CachedAuth {
    exp: i64,
    subject: String,
    scope: String,
    roles: String,
    jti: String,
    last_used: u64,
}

thread_local! {
    /// Per-worker validated-token cache. Entries never migrate between
    /// workers; a worker that exits drops its cache.
    static TOKEN_CACHE: RefCell<HashMap<String, CachedAuth>> = RefCell::new(HashMap::new());
    static CACHE_CLOCK: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
}

fn parse_algorithm(tag: &str) -> Result<Algorithm, GatewayError> {
    match tag {
        "RS256" => Ok(Algorithm::RS256),
        "ES256" => Ok(Algorithm::ES256),
        "HS256" => Ok(Algorithm::HS256),
        other => Err(GatewayError::ConfigInvalid(format!(
            "unsupported JWT algorithm: {other}"
        ))),
    }
}

/// JWT (and static bearer token) authentication.
#[derive(Debug)]
pub struct AuthMiddleware {
    settings: JwtSettings,
    static_tokens: AuthSettings,
    static_keys: Vec<VerificationKey>,
    revoked: HashSet<String>,
    jwks: Option<Arc<JwksKeyStore>>,
}

impl AuthMiddleware {
    /// Builds the middleware, loading static PEM keys from disk. Runs
    /// at snapshot-build time, never on the request path.
    pub fn new(
        settings: JwtSettings,
        static_tokens: AuthSettings,
        jwks: Option<Arc<JwksKeyStore>>,
    ) -> Result<Self, GatewayError> {
        let mut static_keys = Vec::with_capacity(settings.keys.len());
        for key_settings in &settings.keys {
            let algorithm = parse_algorithm(&key_settings.algorithm)?;
            let key = match algorithm {
                Algorithm::HS256 => {
                    let secret = BASE64
                        .decode(&key_settings.secret)
                        .unwrap_or_else(|_| key_settings.secret.as_bytes().to_vec());
                    DecodingKey::from_secret(&secret)
                }
                Algorithm::RS256 => {
                    let pem = std::fs::read(&key_settings.public_key_path).map_err(|e| {
                        GatewayError::ConfigInvalid(format!(
                            "cannot read {}: {e}",
                            key_settings.public_key_path
                        ))
                    })?;
                    DecodingKey::from_rsa_pem(&pem)
                        .map_err(|e| GatewayError::ConfigInvalid(format!("invalid RSA key: {e}")))?
                }
                Algorithm::ES256 => {
                    let pem = std::fs::read(&key_settings.public_key_path).map_err(|e| {
                        GatewayError::ConfigInvalid(format!(
                            "cannot read {}: {e}",
                            key_settings.public_key_path
                        ))
                    })?;
                    DecodingKey::from_ec_pem(&pem)
                        .map_err(|e| GatewayError::ConfigInvalid(format!("invalid EC key: {e}")))?
                }
                _ => unreachable!("parse_algorithm limits the set"),
            };
            static_keys.push(VerificationKey {
                key_id: key_settings.key_id.clone(),
                algorithm,
                key,
            });
        }

        let revoked = settings.revoked_jtis.iter().cloned().collect();
        Ok(AuthMiddleware {
            settings,
            static_tokens,
            static_keys,
            revoked,
            jwks,
        })
    }

    /// Pulls the token from the configured header, falling back to the
    /// `token` query parameter on WebSocket upgrade requests.
    fn extract_token(&self, ctx: &RequestContext) -> Option<String> {
        if let Some(value) = ctx.request.header(&self.settings.header) {
            let scheme = &self.settings.scheme;
            if let Some(token) = value.strip_prefix(scheme.as_str()) {
                let token = token.trim_start();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
            return None;
        }

        let is_upgrade = ctx
            .request
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if is_upgrade {
            for pair in ctx.request.query.split('&') {
                if let Some(token) = pair.strip_prefix("token=") {
                    if !token.is_empty() {
                        return Some(token.to_string());
                    }
                }
            }
        }
        None
    }

    fn cache_lookup(&self, token: &str) -> Option<CachedAuth> {
        if !self.settings.cache_enabled {
            return None;
        }
        let now = chrono::Utc::now().timestamp();
        TOKEN_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            let entry = cache.get_mut(token)?;
            if entry.exp != 0 && entry.exp < now {
                cache.remove(token);
                return None;
            }
            entry.last_used = CACHE_CLOCK.with(|c| {
                let next = c.get() + 1;
                c.set(next);
                next
            });
            Some(entry.clone())
        })
    }

    fn cache_insert(&self, token: &str, auth: CachedAuth) {
        if !self.settings.cache_enabled {
            return;
        }
        let capacity = self.settings.cache_capacity.max(1);
        TOKEN_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.len() >= capacity {
                // Evict the least recently used entry.
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.last_used)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest);
                }
            }
            cache.insert(token.to_string(), auth);
        });
    }

    fn validation_for(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.settings.clock_skew_seconds.max(0) as u64;
        // exp/nbf values are always checked when present; require_exp
        // only controls whether a missing exp is fatal.
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if self.settings.require_exp {
            validation.set_required_spec_claims(&["exp"]);
        } else {
            validation.set_required_spec_claims::<&str>(&[]);
        }
        if !self.settings.allowed_issuers.is_empty() {
            validation.set_issuer(&self.settings.allowed_issuers);
        }
        if !self.settings.allowed_audiences.is_empty() {
            validation.set_audience(&self.settings.allowed_audiences);
        } else {
            validation.validate_aud = false;
        }
        validation
    }

    fn validate_token(&self, token: &str) -> Result<Claims, String> {
        let header = decode_header(token).map_err(|e| format!("malformed token: {e}"))?;
        let kid = header.kid.unwrap_or_default();

        let jwks_snapshot = self.jwks.as_ref().map(|store| store.get());
        let jwks_keys = jwks_snapshot
            .as_ref()
            .map(|s| s.keys.as_slice())
            .unwrap_or(&[]);

        let mut last_error = "no key matched the token".to_string();
        for key in self.static_keys.iter().chain(jwks_keys.iter()) {
            if key.algorithm != header.alg {
                continue;
            }
            if !kid.is_empty() && !key.key_id.is_empty() && key.key_id != kid {
                continue;
            }
            match decode::<Claims>(token, &key.key, &self.validation_for(key.algorithm)) {
                Ok(data) => {
                    let claims = data.claims;
                    if self.settings.require_sub && claims.sub.is_none() {
                        return Err("missing sub claim".to_string());
                    }
                    if let Some(jti) = &claims.jti {
                        if self.revoked.contains(jti) {
                            return Err(format!("token {jti} is revoked"));
                        }
                    }
                    return Ok(claims);
                }
                Err(error) => last_error = error.to_string(),
            }
        }
        Err(last_error)
    }

    fn reject(&self, ctx: &mut RequestContext, reason: String) -> MiddlewareResult {
        debug!(
            "auth rejected for {} {}: {reason}",
            ctx.client_ip, ctx.request.path
        );
        ctx.response = GatewayError::AuthFailed(reason).to_response();
        MiddlewareResult::Stop
    }
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Auth
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        let token = match self.extract_token(ctx) {
            Some(token) => token,
            None => return self.reject(ctx, "missing credentials".to_string()),
        };

        // Static token list, if configured, short-cuts JWT validation.
        if self.static_tokens.enabled && self.static_tokens.valid_tokens.iter().any(|t| t == &token)
        {
            ctx.set_metadata("auth.subject", "static-token");
            return MiddlewareResult::Continue;
        }

        if let Some(cached) = self.cache_lookup(&token) {
            if !cached.jti.is_empty() && self.revoked.contains(&cached.jti) {
                return self.reject(ctx, "token is revoked".to_string());
            }
            ctx.set_metadata("auth.subject", cached.subject);
            ctx.set_metadata("auth.scope", cached.scope);
            ctx.set_metadata("auth.roles", cached.roles);
            return MiddlewareResult::Continue;
        }

        match self.validate_token(&token) {
            Ok(claims) => {
                let subject = claims.sub.clone().unwrap_or_default();
                let scope = claims.scope.clone().unwrap_or_default();
                let roles = claims.roles.join(",");
                ctx.set_metadata("auth.subject", subject.clone());
                ctx.set_metadata("auth.scope", scope.clone());
                ctx.set_metadata("auth.roles", roles.clone());
                self.cache_insert(
                    &token,
                    CachedAuth {
                        exp: claims.exp.unwrap_or(0),
                        subject,
                        scope,
                        roles,
                        jti: claims.jti.unwrap_or_default(),
                        last_used: 0,
                    },
                );
                MiddlewareResult::Continue
            }
            Err(reason) => {
                if self.jwks.is_some() {
                    // A rotation race is the common cause here.
                    warn!("jwt validation failed after merged key set: {reason}");
                }
                self.reject(ctx, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::pipeline::ExchangeContext;
    use crate::gateway::router::RouteMatch;
    use crate::models::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn jwt_settings() -> JwtSettings {
        JwtSettings {
            enabled: true,
            keys: vec![crate::config::settings::JwtKeySettings {
                algorithm: "HS256".to_string(),
                key_id: String::new(),
                public_key_path: String::new(),
                secret: BASE64.encode(SECRET),
            }],
            ..JwtSettings::default()
        }
    }

    fn middleware(settings: JwtSettings) -> AuthMiddleware {
        AuthMiddleware::new(settings, AuthSettings::default(), None).unwrap()
    }

    #[derive(serde::Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        jti: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    }

    fn sign(claims: &TestClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn ctx_with_token(token: &str) -> ExchangeContext {
        let mut request = Request::default();
        request.add_header("Authorization", format!("Bearer {token}"));
        ExchangeContext::new(request, RouteMatch::default(), "10.0.0.1".into(), 1)
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn valid_token_passes_and_sets_metadata() {
        let auth = middleware(jwt_settings());
        let token = sign(&TestClaims {
            sub: "user-1".into(),
            exp: future_exp(),
            jti: None,
            scope: Some("read:users".into()),
        });
        let mut ctx = ctx_with_token(&token);

        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(ctx.metadata("auth.subject"), Some("user-1"));
        assert_eq!(ctx.metadata("auth.scope"), Some("read:users"));
    }

    #[test]
    fn missing_credentials_get_401_with_challenge() {
        let auth = middleware(jwt_settings());
        let mut ctx = ExchangeContext::new(
            Request::default(),
            RouteMatch::default(),
            "10.0.0.1".into(),
            1,
        );

        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Stop);
        assert_eq!(ctx.response.status, 401);
        assert_eq!(ctx.response.header("www-authenticate"), Some("Bearer"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut settings = jwt_settings();
        settings.clock_skew_seconds = 0;
        settings.cache_enabled = false;
        let auth = middleware(settings);
        let token = sign(&TestClaims {
            sub: "user-1".into(),
            exp: chrono::Utc::now().timestamp() - 600,
            jti: None,
            scope: None,
        });
        let mut ctx = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Stop);
        assert_eq!(ctx.response.status, 401);
    }

    #[test]
    fn clock_skew_tolerates_recent_expiry() {
        let mut settings = jwt_settings();
        settings.clock_skew_seconds = 3600;
        settings.cache_enabled = false;
        let auth = middleware(settings);
        let token = sign(&TestClaims {
            sub: "user-1".into(),
            exp: chrono::Utc::now().timestamp() - 60,
            jti: None,
            scope: None,
        });
        let mut ctx = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Continue);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let mut settings = jwt_settings();
        settings.cache_enabled = false;
        let auth = middleware(settings);
        let mut token = sign(&TestClaims {
            sub: "user-1".into(),
            exp: future_exp(),
            jti: None,
            scope: None,
        });
        // Corrupt the signature.
        token.pop();
        token.push('A');
        let mut ctx = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Stop);
    }

    #[test]
    fn revoked_jti_is_rejected() {
        let mut settings = jwt_settings();
        settings.cache_enabled = false;
        settings.revoked_jtis = vec!["revoked-1".to_string()];
        let auth = middleware(settings);
        let token = sign(&TestClaims {
            sub: "user-1".into(),
            exp: future_exp(),
            jti: Some("revoked-1".into()),
            scope: None,
        });
        let mut ctx = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Stop);
        assert_eq!(ctx.response.status, 401);
    }

    #[test]
    fn websocket_upgrade_accepts_query_token() {
        let mut settings = jwt_settings();
        settings.cache_enabled = false;
        let auth = middleware(settings);
        let token = sign(&TestClaims {
            sub: "ws-user".into(),
            exp: future_exp(),
            jti: None,
            scope: None,
        });

        let mut request = Request::default();
        request.add_header("Upgrade", "websocket");
        request.query = format!("token={token}");
        let mut ctx = ExchangeContext::new(request, RouteMatch::default(), "1.2.3.4".into(), 1);

        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(ctx.metadata("auth.subject"), Some("ws-user"));
    }

    #[test]
    fn static_token_list_is_accepted() {
        let static_tokens = AuthSettings {
            enabled: true,
            valid_tokens: vec!["deploy-token".to_string()],
            ..AuthSettings::default()
        };
        let auth = AuthMiddleware::new(jwt_settings(), static_tokens, None).unwrap();
        let mut ctx = ctx_with_token("deploy-token");

        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(ctx.metadata("auth.subject"), Some("static-token"));
    }

    #[test]
    fn cache_serves_repeat_validation() {
        let auth = middleware(jwt_settings());
        let token = sign(&TestClaims {
            sub: "cached-user".into(),
            exp: future_exp(),
            jti: None,
            scope: None,
        });

        let mut first = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut first), MiddlewareResult::Continue);

        // Second pass hits the worker-local cache.
        let mut second = ctx_with_token(&token);
        assert_eq!(auth.process_request(&mut second), MiddlewareResult::Continue);
        assert_eq!(second.metadata("auth.subject"), Some("cached-user"));
    }

    #[test]
    fn generic_error_body_hides_reason() {
        let mut settings = jwt_settings();
        settings.cache_enabled = false;
        let auth = middleware(settings);
        let mut ctx = ctx_with_token("not-a-jwt");
        assert_eq!(auth.process_request(&mut ctx), MiddlewareResult::Stop);
        let body = String::from_utf8(ctx.response.body.clone()).unwrap();
        assert!(body.contains("authentication required"));
        assert!(!body.to_lowercase().contains("signature"));
    }
}
