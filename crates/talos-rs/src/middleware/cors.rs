//! CORS middleware.
//!
//! The request phase short-circuits OPTIONS preflights with a 204; the
//! response phase decorates every response with the configured
//! allow-origin/methods/headers/credentials/max-age headers.

use crate::config::settings::CorsSettings;
use crate::gateway::pipeline::{
    Middleware, MiddlewareKind, MiddlewareResult, RequestContext, ResponseContext,
};
use crate::models::http::Method;

#[derive(Debug)]
pub struct CorsMiddleware {
    settings: CorsSettings,
    allowed_methods: String,
    allowed_headers: String,
}

impl CorsMiddleware {
    pub fn new(settings: CorsSettings) -> Self {
        let allowed_methods = settings.allowed_methods.join(", ");
        let allowed_headers = settings.allowed_headers.join(", ");
        CorsMiddleware {
            settings,
            allowed_methods,
            allowed_headers,
        }
    }

    fn allowed_origin(&self, request_origin: Option<&str>) -> Option<String> {
        if self.settings.allowed_origins.iter().any(|o| o == "*") {
            // Credentials are incompatible with a wildcard origin, so
            // echo the caller's origin in that case.
            if self.settings.allow_credentials {
                return request_origin.map(|o| o.to_string());
            }
            return Some("*".to_string());
        }
        let origin = request_origin?;
        self.settings
            .allowed_origins
            .iter()
            .find(|o| o.as_str() == origin)
            .cloned()
    }

    fn decorate(&self, ctx: &mut ResponseContext) {
        let origin = ctx.request.header("origin").map(|o| o.to_string());
        if let Some(allow) = self.allowed_origin(origin.as_deref()) {
            ctx.response.set_header("Access-Control-Allow-Origin", allow);
        }
        ctx.response
            .set_header("Access-Control-Allow-Methods", self.allowed_methods.clone());
        ctx.response
            .set_header("Access-Control-Allow-Headers", self.allowed_headers.clone());
        if self.settings.allow_credentials {
            ctx.response
                .set_header("Access-Control-Allow-Credentials", "true");
        }
        ctx.response
            .set_header("Access-Control-Max-Age", self.settings.max_age.to_string());
    }
}

impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Cors
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        if ctx.request.method == Some(Method::Options) {
            ctx.response.status = 204;
            ctx.response.body.clear();
            self.decorate(ctx);
            return MiddlewareResult::Stop;
        }
        MiddlewareResult::Continue
    }

    fn process_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        // The preflight already carries its headers; decorating twice is
        // harmless because set_header replaces.
        self.decorate(ctx);
        MiddlewareResult::Continue
    }
}
