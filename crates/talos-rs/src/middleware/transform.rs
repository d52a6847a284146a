//! Request/response transformation middleware.
//!
//! Request phase: prefix-strip and regex path rewrites, request header
//! mutations, and query-string rebuild. Response-header rules are only
//! *recorded* during the request phase (as owned strings on the
//! context) and applied in the response phase, after the upstream
//! response exists.

use crate::config::settings::{HeaderRule, QueryRule, TransformOp, TransformSettings};
use crate::gateway::pipeline::{
    HeaderOp, Middleware, MiddlewareKind, MiddlewareResult, RequestContext, ResponseContext,
};
use crate::models::error::GatewayError;
use regex::Regex;

#[derive(Debug)]
struct CompiledRewrite {
    strip_prefix: String,
    pattern: Option<Regex>,
    replacement: String,
}

#[derive(Debug)]
pub struct TransformMiddleware {
    rewrites: Vec<CompiledRewrite>,
    request_headers: Vec<HeaderRule>,
    response_headers: Vec<HeaderRule>,
    query_rules: Vec<QueryRule>,
}

impl TransformMiddleware {
    /// Compiles the rewrite patterns up front; an invalid pattern is a
    /// configuration error (also caught by validation).
    pub fn new(settings: TransformSettings) -> Result<Self, GatewayError> {
        let mut rewrites = Vec::with_capacity(settings.path_rewrites.len());
        for rule in settings.path_rewrites {
            let pattern = if rule.pattern.is_empty() {
                None
            } else {
                Some(Regex::new(&rule.pattern).map_err(|e| {
                    GatewayError::ConfigInvalid(format!(
                        "invalid rewrite pattern '{}': {e}",
                        rule.pattern
                    ))
                })?)
            };
            rewrites.push(CompiledRewrite {
                strip_prefix: rule.strip_prefix,
                pattern,
                replacement: rule.replacement,
            });
        }
        Ok(TransformMiddleware {
            rewrites,
            request_headers: settings.request_headers,
            response_headers: settings.response_headers,
            query_rules: settings.query,
        })
    }

    fn rewrite_path(&self, path: &str) -> String {
        let mut result = path.to_string();
        for rewrite in &self.rewrites {
            if !rewrite.strip_prefix.is_empty() {
                if let Some(stripped) = result.strip_prefix(&rewrite.strip_prefix) {
                    result = if stripped.starts_with('/') {
                        stripped.to_string()
                    } else {
                        format!("/{stripped}")
                    };
                }
            }
            if let Some(pattern) = &rewrite.pattern {
                result = pattern
                    .replace(&result, rewrite.replacement.as_str())
                    .into_owned();
            }
        }
        result
    }

    fn rebuild_query(&self, query: &str) -> String {
        let mut params: Vec<(String, String)> = query
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();

        for rule in &self.query_rules {
            match rule.op {
                TransformOp::Add => params.push((rule.name.clone(), rule.value.clone())),
                TransformOp::Set => {
                    let mut found = false;
                    for (name, value) in &mut params {
                        if *name == rule.name {
                            *value = rule.value.clone();
                            found = true;
                        }
                    }
                    if !found {
                        params.push((rule.name.clone(), rule.value.clone()));
                    }
                }
                TransformOp::Remove => params.retain(|(name, _)| *name != rule.name),
            }
        }

        params
            .into_iter()
            .map(|(name, value)| {
                if value.is_empty() {
                    name
                } else {
                    format!("{name}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl Middleware for TransformMiddleware {
    fn name(&self) -> &str {
        "transform"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Transform
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        if !self.rewrites.is_empty() {
            ctx.request.path = self.rewrite_path(&ctx.request.path);
        }

        for rule in &self.request_headers {
            match rule.op {
                TransformOp::Add => ctx.request.add_header(rule.name.clone(), rule.value.clone()),
                TransformOp::Set => ctx.request.set_header(&rule.name, rule.value.clone()),
                TransformOp::Remove => ctx.request.remove_header(&rule.name),
            }
        }

        if !self.query_rules.is_empty() {
            ctx.request.query = self.rebuild_query(&ctx.request.query);
        }

        // Response-header work is deferred; record owned ops only.
        for rule in &self.response_headers {
            let op = match rule.op {
                TransformOp::Add => HeaderOp::Add(rule.name.clone(), rule.value.clone()),
                TransformOp::Set => HeaderOp::Set(rule.name.clone(), rule.value.clone()),
                TransformOp::Remove => HeaderOp::Remove(rule.name.clone()),
            };
            ctx.response_header_ops.push(op);
        }

        MiddlewareResult::Continue
    }

    fn process_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        ctx.apply_response_header_ops();
        MiddlewareResult::Continue
    }
}
