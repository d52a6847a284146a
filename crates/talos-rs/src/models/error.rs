//! Gateway error taxonomy and its mapping onto HTTP statuses.
//!
//! Protocol-level errors are recovered locally (connection- or
//! stream-scoped) and never escalate beyond the offending entity.
//! Upstream failures and middleware stops are translated into a
//! synthesized response which still flows through the response phase of
//! the pipeline, so headers and logging stay consistent.

use crate::models::http::Response;
use serde_json::json;

/// Error kinds produced inside the gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Schema or cross-reference failure; fatal at load time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Socket/bind/listen failure; fatal at startup.
    #[error("failed to bind listener: {0}")]
    BindFailed(std::io::Error),

    /// Malformed HTTP/1.1, HTTP/2 framing, or WebSocket framing from the
    /// client. The connection is terminated with the closest
    /// protocol-appropriate error.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// No backend selectable: empty set, all unhealthy, or breaker open.
    #[error("upstream {0} unavailable")]
    UpstreamUnavailable(String),

    /// Connect/send/recv failure to a selected backend after retries.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Per-route or per-upstream timeout elapsed.
    #[error("upstream timed out after {0} ms")]
    UpstreamTimeout(u64),

    /// JWT validation or revocation check failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Claims insufficient for the route's requirements.
    #[error("authorization failed: {0}")]
    AuthzFailed(String),

    /// Token bucket empty.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Assertion or invariant violation inside the core.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The HTTP status this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::ConfigInvalid(_) => 500,
            GatewayError::BindFailed(_) => 500,
            GatewayError::ClientProtocol(_) => 400,
            GatewayError::UpstreamUnavailable(_) => 503,
            GatewayError::UpstreamTransport(_) => 502,
            GatewayError::UpstreamTimeout(_) => 504,
            GatewayError::AuthFailed(_) => 401,
            GatewayError::AuthzFailed(_) => 403,
            GatewayError::RateLimited => 429,
            GatewayError::Internal(_) => 500,
        }
    }

    /// Short machine-readable tag used in error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ConfigInvalid(_) => "config_invalid",
            GatewayError::BindFailed(_) => "bind_failed",
            GatewayError::ClientProtocol(_) => "client_protocol",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::UpstreamTransport(_) => "upstream_transport",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::AuthFailed(_) => "auth_failed",
            GatewayError::AuthzFailed(_) => "authz_failed",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// Builds the synthesized response for this error.
    ///
    /// Authentication failures carry a `WWW-Authenticate` challenge and a
    /// deliberately generic body so the reason for rejection is not
    /// disclosed to the caller.
    pub fn to_response(&self) -> Response {
        let mut response = Response::with_status(self.status_code());
        match self {
            GatewayError::AuthFailed(_) => {
                response.add_header("WWW-Authenticate", "Bearer");
                response.set_json_body(json!({
                    "error": "authentication required",
                    "type": self.kind(),
                }));
            }
            GatewayError::RateLimited => {
                response.set_json_body(json!({
                    "error": self.to_string(),
                    "type": self.kind(),
                }));
            }
            _ => {
                response.set_json_body(json!({
                    "error": self.to_string(),
                    "type": self.kind(),
                }));
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::UpstreamUnavailable("u".into()).status_code(), 503);
        assert_eq!(GatewayError::UpstreamTransport("x".into()).status_code(), 502);
        assert_eq!(GatewayError::UpstreamTimeout(100).status_code(), 504);
        assert_eq!(GatewayError::AuthFailed("bad".into()).status_code(), 401);
        assert_eq!(GatewayError::AuthzFailed("scope".into()).status_code(), 403);
        assert_eq!(GatewayError::RateLimited.status_code(), 429);
        assert_eq!(GatewayError::ClientProtocol("framing".into()).status_code(), 400);
        assert_eq!(GatewayError::Internal("bug".into()).status_code(), 500);
    }

    #[test]
    fn auth_failure_carries_challenge_and_generic_body() {
        let response = GatewayError::AuthFailed("signature mismatch".into()).to_response();
        assert_eq!(response.status, 401);
        assert_eq!(response.header("WWW-Authenticate"), Some("Bearer"));
        let body = String::from_utf8(response.body.clone()).unwrap();
        assert!(!body.contains("signature"));
    }
}
