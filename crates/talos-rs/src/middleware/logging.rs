//! Request logging middleware.
//!
//! Runs in the response phase so it can record the final status and the
//! total duration, whether the response came from the upstream or from
//! a short-circuiting stage.

use crate::gateway::pipeline::{Middleware, MiddlewareKind, MiddlewareResult, ResponseContext};
use log::info;

#[derive(Debug)]
pub struct LoggingMiddleware {
    /// Paths excluded from request logging (health probes, metrics).
    exclude_paths: Vec<String>,
}

impl LoggingMiddleware {
    pub fn new(exclude_paths: Vec<String>) -> Self {
        LoggingMiddleware { exclude_paths }
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Logging
    }

    fn process_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        if self.exclude_paths.iter().any(|p| p == &ctx.request.path) {
            return MiddlewareResult::Continue;
        }

        let method = ctx
            .request
            .method
            .map(|m| m.as_str())
            .unwrap_or("-");
        info!(
            "{} {} {} {}ms client={} correlation={}",
            method,
            ctx.request.path,
            ctx.response.status,
            ctx.elapsed_ms(),
            ctx.client_ip,
            ctx.correlation_id,
        );
        MiddlewareResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::pipeline::ExchangeContext;
    use crate::gateway::router::RouteMatch;
    use crate::models::http::Request;

    #[test]
    fn logging_never_blocks_the_pipeline() {
        let middleware = LoggingMiddleware::new(vec!["/health".to_string()]);
        let mut ctx = ExchangeContext::new(
            Request::default(),
            RouteMatch::default(),
            "10.0.0.1".to_string(),
            1234,
        );
        assert_eq!(middleware.process_response(&mut ctx), MiddlewareResult::Continue);

        ctx.request.path = "/health".to_string();
        assert_eq!(middleware.process_response(&mut ctx), MiddlewareResult::Continue);
    }
}
