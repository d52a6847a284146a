//! Two-phase middleware pipeline.
//!
//! Each request runs the chain twice: once on the request before
//! dispatch (`process_request`) and once on the response before bytes
//! are written back (`process_response`). Both phases run in declared
//! order. `Stop` short-circuits the remaining stages of the current
//! phase - the stopping middleware is expected to have filled the
//! response. `Error` makes the dispatcher synthesize a 5xx. Responses
//! produced by a short-circuit still flow through the response phase so
//! headers and logging stay consistent.

use crate::gateway::router::RouteMatch;
use crate::models::http::{Request, Response};
use ahash::HashMap as AHashMap;
use std::time::Instant;
use uuid::Uuid;

/// Outcome of one middleware stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareResult {
    /// Continue with the next stage.
    Continue,
    /// Short-circuit the remaining stages of this phase.
    Stop,
    /// Abort the exchange with a synthesized 5xx.
    Error,
}

/// Middleware type tags, used by the REPLACEMENT conflict policy: when a
/// route lists several middleware of one type, only the first is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MiddlewareKind {
    Logging,
    Cors,
    RateLimit,
    Auth,
    Authz,
    Transform,
    Compression,
}

impl MiddlewareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MiddlewareKind::Logging => "logging",
            MiddlewareKind::Cors => "cors",
            MiddlewareKind::RateLimit => "rate_limit",
            MiddlewareKind::Auth => "auth",
            MiddlewareKind::Authz => "authz",
            MiddlewareKind::Transform => "transform",
            MiddlewareKind::Compression => "compression",
        }
    }
}

/// A recorded header mutation, applied during the response phase.
///
/// Values are owned strings: transform rules captured in the request
/// phase must not borrow from config structures that may be swapped
/// mid-flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Add(String, String),
    Set(String, String),
    Remove(String),
}

/// Shared state of one request/response exchange.
///
/// The same structure backs both phases; [`RequestContext`] and
/// [`ResponseContext`] name the phase a middleware participates in.
#[derive(Debug)]
pub struct ExchangeContext {
    pub request: Request,
    pub response: Response,
    pub route: RouteMatch,
    pub client_ip: String,
    pub client_port: u16,
    pub start_time: Instant,
    pub correlation_id: String,
    /// String map for cross-middleware communication (e.g. auth claims).
    pub metadata: AHashMap<String, String>,
    pub has_error: bool,
    pub error_message: String,
    /// Response-header mutations recorded in the request phase.
    pub response_header_ops: Vec<HeaderOp>,
}

pub type RequestContext = ExchangeContext;
pub type ResponseContext = ExchangeContext;

impl ExchangeContext {
    pub fn new(request: Request, route: RouteMatch, client_ip: String, client_port: u16) -> Self {
        ExchangeContext {
            request,
            response: Response::default(),
            route,
            client_ip,
            client_port,
            start_time: Instant::now(),
            correlation_id: Uuid::new_v4().to_string(),
            metadata: AHashMap::default(),
            has_error: false,
            error_message: String::new(),
            response_header_ops: Vec::new(),
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.has_error = true;
        self.error_message = message.into();
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Applies the recorded header operations to the response.
    pub fn apply_response_header_ops(&mut self) {
        for op in std::mem::take(&mut self.response_header_ops) {
            match op {
                HeaderOp::Add(name, value) => self.response.add_header(name, value),
                HeaderOp::Set(name, value) => self.response.set_header(&name, value),
                HeaderOp::Remove(name) => self.response.remove_header(&name),
            }
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }
}

/// A pluggable pipeline stage.
///
/// Stages default both phases to pass-through so a middleware only
/// implements the phase it cares about.
pub trait Middleware: std::fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> MiddlewareKind;

    fn process_request(&self, _ctx: &mut RequestContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }

    fn process_response(&self, _ctx: &mut ResponseContext) -> MiddlewareResult {
        MiddlewareResult::Continue
    }
}

/// An ordered middleware chain for one route.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { stages: Vec::new() }
    }

    pub fn use_middleware(&mut self, middleware: Box<dyn Middleware>) {
        self.stages.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of the stages in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs the request phase in declared order.
    pub fn execute_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        for stage in &self.stages {
            match stage.process_request(ctx) {
                MiddlewareResult::Continue => {}
                MiddlewareResult::Stop => return MiddlewareResult::Stop,
                MiddlewareResult::Error => return MiddlewareResult::Error,
            }
            if ctx.has_error {
                return MiddlewareResult::Error;
            }
        }
        MiddlewareResult::Continue
    }

    /// Runs the response phase, in the same declared order as the
    /// request phase (not reversed).
    pub fn execute_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        for stage in &self.stages {
            match stage.process_response(ctx) {
                MiddlewareResult::Continue => {}
                MiddlewareResult::Stop => return MiddlewareResult::Stop,
                MiddlewareResult::Error => return MiddlewareResult::Error,
            }
        }
        MiddlewareResult::Continue
    }
}
