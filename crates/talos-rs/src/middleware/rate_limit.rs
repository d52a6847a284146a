//! Rate limiting middleware: thread-local token buckets.
//!
//! Each worker keeps its own buckets (no synchronization, approximate
//! process-wide limits): a worker that never sees a client never pays
//! for tracking it, and no mutex lands on the per-request hot path. The
//! bucket key defaults to the client IP and may be switched to a header
//! value with `key = "header:X-Api-Key"`.

use crate::config::settings::RateLimitSettings;
use crate::gateway::pipeline::{Middleware, MiddlewareKind, MiddlewareResult, RequestContext};
use log::debug;
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Instant;

/// A token bucket. Worker-local, so plain fields suffice.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `capacity` is the burst size, `refill_rate` is tokens per second.
    pub fn new(capacity: u32, refill_rate: u32) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            refill_rate: refill_rate as f64,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
    }

    /// Attempts to take `tokens` tokens.
    pub fn consume(&mut self, tokens: u32) -> bool {
        self.refill();
        let needed = tokens as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> u32 {
        self.tokens as u32
    }
}

thread_local! {
    /// Buckets for every limiter on this worker, keyed by
    /// (limiter id, client key).
    static BUCKETS: RefCell<HashMap<(String, String), TokenBucket>> =
        RefCell::new(HashMap::new());
}

/// Rate limiting middleware instance.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    /// Distinguishes this limiter's buckets from other instances on the
    /// same worker (global vs per-route pools).
    limiter_id: String,
    settings: RateLimitSettings,
}

impl RateLimitMiddleware {
    pub fn new(limiter_id: impl Into<String>, settings: RateLimitSettings) -> Self {
        RateLimitMiddleware {
            limiter_id: limiter_id.into(),
            settings,
        }
    }

    fn bucket_key(&self, ctx: &RequestContext) -> Option<String> {
        match self.settings.key.as_str() {
            "client_ip" | "" => Some(ctx.client_ip.clone()),
            other => match other.strip_prefix("header:") {
                Some(header) => ctx.request.header(header).map(|v| v.to_string()),
                None => Some(ctx.client_ip.clone()),
            },
        }
    }

    fn allow(&self, key: &str) -> bool {
        BUCKETS.with(|buckets| {
            let mut buckets = buckets.borrow_mut();
            let bucket = buckets
                .entry((self.limiter_id.clone(), key.to_string()))
                .or_insert_with(|| {
                    TokenBucket::new(self.settings.burst_size, self.settings.requests_per_second)
                });
            bucket.consume(1)
        })
    }

    /// Drops every bucket owned by this worker. Test hook; workers drop
    /// their buckets implicitly when the thread exits.
    #[cfg(test)]
    fn clear_worker_buckets() {
        BUCKETS.with(|buckets| buckets.borrow_mut().clear());
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::RateLimit
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        let key = match self.bucket_key(ctx) {
            Some(key) if !key.is_empty() => key,
            // No usable key (e.g. missing header): admit rather than
            // collapsing every anonymous caller into one bucket.
            _ => return MiddlewareResult::Continue,
        };

        if self.allow(&key) {
            return MiddlewareResult::Continue;
        }

        debug!("rate limit exceeded for key {key}");
        ctx.response.status = 429;
        ctx.response.set_json_body(json!({
            "error": "rate limit exceeded",
            "type": "rate_limited",
        }));
        ctx.response.set_header("Retry-After", "1");
        MiddlewareResult::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::pipeline::ExchangeContext;
    use crate::gateway::router::RouteMatch;
    use crate::models::http::Request;

    fn ctx_for_ip(ip: &str) -> ExchangeContext {
        ExchangeContext::new(Request::default(), RouteMatch::default(), ip.into(), 1)
    }

    fn limiter(id: &str, burst: u32, rate: u32) -> RateLimitMiddleware {
        RateLimitMiddleware::new(
            id,
            RateLimitSettings {
                enabled: true,
                requests_per_second: rate,
                burst_size: burst,
                key: "client_ip".to_string(),
            },
        )
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(2, 1000);
        assert!(bucket.consume(1));
        assert!(bucket.consume(1));
        assert!(!bucket.consume(1));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(bucket.consume(1));
    }

    #[test]
    fn empty_bucket_stops_with_429() {
        RateLimitMiddleware::clear_worker_buckets();
        let middleware = limiter("t-stop", 2, 1);
        let mut ctx = ctx_for_ip("10.1.1.1");

        assert_eq!(middleware.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(middleware.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(middleware.process_request(&mut ctx), MiddlewareResult::Stop);
        assert_eq!(ctx.response.status, 429);
        assert_eq!(ctx.response.header("retry-after"), Some("1"));
    }

    #[test]
    fn buckets_are_per_client() {
        RateLimitMiddleware::clear_worker_buckets();
        let middleware = limiter("t-per-client", 1, 1);

        let mut first = ctx_for_ip("10.1.1.2");
        let mut second = ctx_for_ip("10.1.1.3");
        assert_eq!(middleware.process_request(&mut first), MiddlewareResult::Continue);
        // The second client has its own untouched bucket.
        assert_eq!(middleware.process_request(&mut second), MiddlewareResult::Continue);
        assert_eq!(middleware.process_request(&mut first), MiddlewareResult::Stop);
    }

    #[test]
    fn header_key_uses_header_value() {
        RateLimitMiddleware::clear_worker_buckets();
        let middleware = RateLimitMiddleware::new(
            "t-header",
            RateLimitSettings {
                enabled: true,
                requests_per_second: 1,
                burst_size: 1,
                key: "header:X-Api-Key".to_string(),
            },
        );

        let mut ctx = ctx_for_ip("10.1.1.4");
        ctx.request.add_header("X-Api-Key", "alpha");
        assert_eq!(middleware.process_request(&mut ctx), MiddlewareResult::Continue);
        assert_eq!(middleware.process_request(&mut ctx), MiddlewareResult::Stop);

        // A caller without the header is admitted (no key to track).
        let mut anonymous = ctx_for_ip("10.1.1.5");
        assert_eq!(
            middleware.process_request(&mut anonymous),
            MiddlewareResult::Continue
        );
    }

    #[test]
    fn limiters_do_not_share_buckets() {
        RateLimitMiddleware::clear_worker_buckets();
        let global = limiter("t-global", 1, 1);
        let per_route = limiter("t-route", 1, 1);
        let mut ctx = ctx_for_ip("10.1.1.6");

        assert_eq!(global.process_request(&mut ctx), MiddlewareResult::Continue);
        // Different limiter id, separate bucket for the same client.
        assert_eq!(per_route.process_request(&mut ctx), MiddlewareResult::Continue);
    }
}
