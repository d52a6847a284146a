//! Claims-based authorization middleware.
//!
//! Runs after authentication and reads the scopes/roles the auth stage
//! left in the context metadata, checking them against the route's
//! requirements with AND or OR semantics. Insufficient claims surface
//! as 403 (as opposed to 401 for a bad token).

use crate::gateway::pipeline::{Middleware, MiddlewareKind, MiddlewareResult, RequestContext};
use crate::models::error::GatewayError;
use log::debug;

#[derive(Debug)]
pub struct AuthzMiddleware {
    required_scopes: Vec<String>,
    required_roles: Vec<String>,
    /// true = all scopes required (AND), false = any scope (OR).
    require_all_scopes: bool,
}

impl AuthzMiddleware {
    pub fn new(
        required_scopes: Vec<String>,
        required_roles: Vec<String>,
        require_all_scopes: bool,
    ) -> Self {
        AuthzMiddleware {
            required_scopes,
            required_roles,
            require_all_scopes,
        }
    }

    fn scopes_satisfied(&self, granted: &[&str]) -> bool {
        if self.required_scopes.is_empty() {
            return true;
        }
        if self.require_all_scopes {
            self.required_scopes
                .iter()
                .all(|needed| granted.contains(&needed.as_str()))
        } else {
            self.required_scopes
                .iter()
                .any(|needed| granted.contains(&needed.as_str()))
        }
    }

    fn roles_satisfied(&self, granted: &[&str]) -> bool {
        if self.required_roles.is_empty() {
            return true;
        }
        self.required_roles
            .iter()
            .any(|needed| granted.contains(&needed.as_str()))
    }
}

impl Middleware for AuthzMiddleware {
    fn name(&self) -> &str {
        "authz"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Authz
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        // Scopes are space-separated (OAuth convention), roles
        // comma-separated as the auth stage wrote them.
        let scope_value = ctx.metadata("auth.scope").unwrap_or("").to_string();
        let roles_value = ctx.metadata("auth.roles").unwrap_or("").to_string();
        let granted_scopes: Vec<&str> = scope_value.split_whitespace().collect();
        let granted_roles: Vec<&str> =
            roles_value.split(',').filter(|r| !r.is_empty()).collect();

        if self.scopes_satisfied(&granted_scopes) && self.roles_satisfied(&granted_roles) {
            return MiddlewareResult::Continue;
        }

        debug!(
            "authz denied for {}: scopes={scope_value:?} roles={roles_value:?}",
            ctx.request.path
        );
        ctx.response =
            GatewayError::AuthzFailed("insufficient permissions".to_string()).to_response();
        MiddlewareResult::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::pipeline::ExchangeContext;
    use crate::gateway::router::RouteMatch;
    use crate::models::http::Request;

    fn ctx_with_claims(scope: &str, roles: &str) -> ExchangeContext {
        let mut ctx = ExchangeContext::new(
            Request::default(),
            RouteMatch::default(),
            "10.0.0.1".into(),
            1,
        );
        ctx.set_metadata("auth.scope", scope);
        ctx.set_metadata("auth.roles", roles);
        ctx
    }

    #[test]
    fn any_scope_matches_with_or_semantics() {
        let authz = AuthzMiddleware::new(
            vec!["read:users".into(), "admin".into()],
            Vec::new(),
            false,
        );
        let mut ctx = ctx_with_claims("read:users write:posts", "");
        assert_eq!(authz.process_request(&mut ctx), MiddlewareResult::Continue);
    }

    #[test]
    fn and_semantics_requires_every_scope() {
        let authz =
            AuthzMiddleware::new(vec!["read:users".into(), "admin".into()], Vec::new(), true);

        let mut partial = ctx_with_claims("read:users", "");
        assert_eq!(authz.process_request(&mut partial), MiddlewareResult::Stop);
        assert_eq!(partial.response.status, 403);

        let mut full = ctx_with_claims("admin read:users", "");
        assert_eq!(authz.process_request(&mut full), MiddlewareResult::Continue);
    }

    #[test]
    fn role_requirements_check_role_list() {
        let authz = AuthzMiddleware::new(Vec::new(), vec!["operator".into()], false);

        let mut denied = ctx_with_claims("", "viewer,editor");
        assert_eq!(authz.process_request(&mut denied), MiddlewareResult::Stop);

        let mut allowed = ctx_with_claims("", "viewer,operator");
        assert_eq!(authz.process_request(&mut allowed), MiddlewareResult::Continue);
    }

    #[test]
    fn no_requirements_always_passes() {
        let authz = AuthzMiddleware::new(Vec::new(), Vec::new(), false);
        let mut ctx = ctx_with_claims("", "");
        assert_eq!(authz.process_request(&mut ctx), MiddlewareResult::Continue);
    }

    #[test]
    fn missing_auth_metadata_is_denied_when_scopes_required() {
        let authz = AuthzMiddleware::new(vec!["admin".into()], Vec::new(), false);
        let mut ctx = ExchangeContext::new(
            Request::default(),
            RouteMatch::default(),
            "10.0.0.1".into(),
            1,
        );
        assert_eq!(authz.process_request(&mut ctx), MiddlewareResult::Stop);
        assert_eq!(ctx.response.status, 403);
    }
}
