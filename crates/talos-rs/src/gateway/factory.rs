//! Builds the per-worker gateway state from a configuration snapshot.
//!
//! Each worker rebuilds its router, upstream manager, and per-route
//! pipelines deterministically whenever the config store publishes a
//! new generation. Backend hint slots are numbered in config order, so
//! every worker maps the same backend to the same slot.
//!
//! Middleware chains follow the REPLACEMENT model: the chain is
//! assembled in the canonical stage order (logging, cors, rate_limit,
//! auth, authz, transform, compression) and a route-listed pool entry
//! replaces the global default of its type. When a route lists several
//! entries of one type, only the first is built; the rest were already
//! flagged by validation and are skipped here.

use crate::config::settings::Config;
use crate::config::store::ConfigSnapshot;
use crate::gateway::circuit_breaker::CircuitBreaker;
use crate::gateway::load_balancer::create_balancer;
use crate::gateway::pipeline::{
    Middleware, MiddlewareKind, MiddlewareResult, Pipeline, RequestContext, ResponseContext,
};
use crate::gateway::router::{Route, Router};
use crate::gateway::upstream::{Backend, Upstream, UpstreamManager};
use crate::middleware::auth::{AuthMiddleware, JwksKeyStore};
use crate::middleware::authz::AuthzMiddleware;
use crate::middleware::compression::{CompressionMiddleware, ResponseEncoder};
use crate::middleware::cors::CorsMiddleware;
use crate::middleware::logging::LoggingMiddleware;
use crate::middleware::rate_limit::RateLimitMiddleware;
use crate::middleware::transform::TransformMiddleware;
use crate::models::error::GatewayError;
use log::warn;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// External collaborators injected into pipeline construction.
#[derive(Debug, Default, Clone)]
pub struct GatewayDeps {
    /// Shared JWKS snapshots for the auth middleware.
    pub jwks: Option<Arc<JwksKeyStore>>,
    /// Produces the compression codecs available on this build.
    pub encoder_factory: Option<fn() -> Vec<Box<dyn ResponseEncoder>>>,
}

/// One worker's materialized view of a config snapshot.
#[derive(Debug)]
pub struct GatewaySnapshot {
    pub config: Arc<ConfigSnapshot>,
    pub router: Router,
    pub upstreams: UpstreamManager,
    /// Pipelines indexed by route index.
    pipelines: Vec<Pipeline>,
}

impl GatewaySnapshot {
    pub fn generation(&self) -> u64 {
        self.config.generation
    }

    pub fn pipeline(&self, route_index: usize) -> Option<&Pipeline> {
        self.pipelines.get(route_index)
    }

    /// Per-route timeout override, when configured.
    pub fn route_timeout(&self, route_index: usize) -> Option<Duration> {
        self.config
            .config
            .routes
            .get(route_index)
            .and_then(|r| r.timeout)
            .map(Duration::from_millis)
    }

    /// Per-route path rewrite, when configured.
    pub fn route_rewrite(&self, route_index: usize) -> Option<&str> {
        self.config
            .config
            .routes
            .get(route_index)
            .and_then(|r| r.rewrite_path.as_deref())
    }
}

/// Delegating stage so one middleware instance (auth with its loaded
/// keys, for example) can be shared across every route pipeline of a
/// worker.
#[derive(Debug)]
struct Shared<M>(Rc<M>);

impl<M: Middleware> Middleware for Shared<M> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn kind(&self) -> MiddlewareKind {
        self.0.kind()
    }

    fn process_request(&self, ctx: &mut RequestContext) -> MiddlewareResult {
        self.0.process_request(ctx)
    }

    fn process_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        self.0.process_response(ctx)
    }
}

/// Builds the router from the snapshot's route list.
pub fn build_router(config: &Config) -> Result<Router, GatewayError> {
    let mut router = Router::new();
    for (route_index, route) in config.routes.iter().enumerate() {
        let method = route
            .method_filter()
            .map_err(GatewayError::ConfigInvalid)?;
        router.add_route(Route {
            path: route.path.clone(),
            method,
            handler_id: route.effective_handler_id().to_string(),
            upstream_name: route.upstream.clone(),
            priority: route.priority,
            route_index,
        });
    }
    Ok(router)
}

/// Builds the upstream manager with deterministic backend hint slots.
pub fn build_upstream_manager(config: &Config) -> UpstreamManager {
    let mut manager = UpstreamManager::new();
    let mut next_backend_slot = 0usize;

    for upstream_settings in &config.upstreams {
        let mut upstream = Upstream::new(
            upstream_settings.name.clone(),
            create_balancer(upstream_settings.load_balancing),
            upstream_settings.pool_size as usize,
            Duration::from_secs(upstream_settings.pool_idle_timeout as u64),
        );
        upstream.max_retries = upstream_settings.max_retries;
        upstream.retry_timeout = Duration::from_millis(upstream_settings.retry_timeout);

        for backend_settings in &upstream_settings.backends {
            let mut backend = Backend::new(backend_settings.host.clone(), backend_settings.port);
            backend.weight = backend_settings.weight;
            backend.max_connections = backend_settings.max_connections;

            if upstream_settings.circuit_breaker.enabled {
                let breaker =
                    CircuitBreaker::new(upstream_settings.circuit_breaker.to_breaker_config())
                        .with_backend_id(next_backend_slot);
                backend.breaker = Some(breaker);
            }
            next_backend_slot += 1;

            upstream.add_backend(backend);
        }
        manager.register_upstream(upstream);
    }
    manager
}

/// Builds every per-route pipeline.
fn build_pipelines(
    config: &Config,
    deps: &GatewayDeps,
) -> Result<Vec<Pipeline>, GatewayError> {
    // Shared stages built once per worker snapshot.
    let logging = Rc::new(LoggingMiddleware::new(config.logging.exclude_paths.clone()));
    let global_cors = config
        .cors
        .enabled
        .then(|| Rc::new(CorsMiddleware::new(config.cors.clone())));
    let global_rate_limit = (config.rate_limit.enabled
        && config.rate_limit.requests_per_second > 0)
        .then(|| Rc::new(RateLimitMiddleware::new("global", config.rate_limit.clone())));
    let auth = if config.jwt.enabled || config.auth.enabled {
        Some(Rc::new(AuthMiddleware::new(
            config.jwt.clone(),
            config.auth.clone(),
            deps.jwks.clone(),
        )?))
    } else {
        None
    };

    let mut pipelines = Vec::with_capacity(config.routes.len());
    for route in &config.routes {
        // First pool id of each type wins (REPLACEMENT model).
        let mut chosen: HashMap<&'static str, &str> = HashMap::new();
        for id in &route.middleware {
            match config.middlewares.kind_of(id) {
                Some(kind) => {
                    if chosen.contains_key(kind) {
                        warn!(
                            "route {}: skipping middleware '{id}' (a '{kind}' stage already ran)",
                            route.path
                        );
                    } else {
                        chosen.insert(kind, id.as_str());
                    }
                }
                // Unknown ids were rejected by validation already.
                None => {}
            }
        }

        let mut pipeline = Pipeline::new();

        if config.logging.log_requests {
            pipeline.use_middleware(Box::new(Shared(logging.clone())));
        }

        match chosen.get("cors") {
            Some(id) => {
                let settings = config.middlewares.cors[*id].clone();
                if settings.enabled {
                    pipeline.use_middleware(Box::new(CorsMiddleware::new(settings)));
                }
            }
            None => {
                if let Some(cors) = &global_cors {
                    pipeline.use_middleware(Box::new(Shared(cors.clone())));
                }
            }
        }

        match chosen.get("rate_limit") {
            Some(id) => {
                let settings = config.middlewares.rate_limit[*id].clone();
                if settings.enabled && settings.requests_per_second > 0 {
                    pipeline.use_middleware(Box::new(RateLimitMiddleware::new(*id, settings)));
                }
            }
            None => {
                if let Some(rate_limit) = &global_rate_limit {
                    pipeline.use_middleware(Box::new(Shared(rate_limit.clone())));
                }
            }
        }

        if let Some(auth) = &auth {
            pipeline.use_middleware(Box::new(Shared(auth.clone())));
        }

        if !route.required_scopes.is_empty() || !route.required_roles.is_empty() {
            pipeline.use_middleware(Box::new(AuthzMiddleware::new(
                route.required_scopes.clone(),
                route.required_roles.clone(),
                route.require_all_scopes,
            )));
        }

        if let Some(id) = chosen.get("transform") {
            let settings = config.middlewares.transform[*id].clone();
            pipeline.use_middleware(Box::new(TransformMiddleware::new(settings)?));
        }

        if let Some(id) = chosen.get("compression") {
            let settings = config.middlewares.compression[*id].clone();
            if settings.enabled {
                let encoders = deps.encoder_factory.map(|f| f()).unwrap_or_default();
                pipeline.use_middleware(Box::new(CompressionMiddleware::new(settings, encoders)));
            }
        }

        pipelines.push(pipeline);
    }
    Ok(pipelines)
}

/// Materializes a full gateway view from a validated snapshot.
pub fn build_gateway(
    snapshot: Arc<ConfigSnapshot>,
    deps: &GatewayDeps,
) -> Result<GatewaySnapshot, GatewayError> {
    let router = build_router(&snapshot.config)?;
    let upstreams = build_upstream_manager(&snapshot.config);
    let pipelines = build_pipelines(&snapshot.config, deps)?;
    Ok(GatewaySnapshot {
        config: snapshot,
        router,
        upstreams,
        pipelines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::parse_config;
    use crate::models::http::Method;

    fn snapshot(json: &str) -> Arc<ConfigSnapshot> {
        Arc::new(ConfigSnapshot {
            config: parse_config(json).unwrap(),
            generation: 1,
        })
    }

    #[test]
    fn builds_router_upstreams_and_pipelines() {
        let snapshot = snapshot(
            r#"{
                "upstreams": [{
                    "name": "api",
                    "backends": [{"host": "10.0.0.1", "port": 8081}]
                }],
                "routes": [{"path": "/users/:id", "method": "GET", "upstream": "api"}],
                "cors": {"enabled": true}
            }"#,
        );
        let gateway = build_gateway(snapshot, &GatewayDeps::default()).unwrap();

        let found = gateway.router.find(Method::Get, "/users/9");
        assert!(found.matched());
        assert_eq!(found.upstream_name, "api");
        assert!(gateway.upstreams.get("api").is_some());

        let pipeline = gateway.pipeline(0).unwrap();
        // logging + global cors
        assert_eq!(pipeline.stage_names(), vec!["logging", "cors"]);
    }

    #[test]
    fn route_pool_replaces_global_of_same_type() {
        let snapshot = snapshot(
            r#"{
                "upstreams": [{"name": "api", "backends": [{"host": "h", "port": 81}]}],
                "routes": [
                    {"path": "/a", "upstream": "api", "middleware": ["strict"]},
                    {"path": "/b", "upstream": "api"}
                ],
                "rate_limit": {"enabled": true, "requests_per_second": 100},
                "middlewares": {"rate_limit": {"strict": {"enabled": true, "requests_per_second": 1, "burst_size": 1}}}
            }"#,
        );
        let gateway = build_gateway(snapshot, &GatewayDeps::default()).unwrap();

        // Both routes have exactly one rate_limit stage.
        for route_index in [0usize, 1] {
            let names = gateway.pipeline(route_index).unwrap().stage_names();
            assert_eq!(
                names.iter().filter(|n| **n == "rate_limit").count(),
                1,
                "route {route_index}: {names:?}"
            );
        }
    }

    #[test]
    fn duplicate_pool_types_build_only_first() {
        let snapshot = snapshot(
            r#"{
                "upstreams": [{"name": "api", "backends": [{"host": "h", "port": 81}]}],
                "routes": [{"path": "/a", "upstream": "api", "middleware": ["c1", "c2"]}],
                "middlewares": {"cors": {
                    "c1": {"enabled": true, "max_age": 111},
                    "c2": {"enabled": true, "max_age": 222}
                }}
            }"#,
        );
        let gateway = build_gateway(snapshot, &GatewayDeps::default()).unwrap();
        let names = gateway.pipeline(0).unwrap().stage_names();
        assert_eq!(names.iter().filter(|n| **n == "cors").count(), 1);
    }

    #[test]
    fn authz_stage_appears_only_with_requirements() {
        let snapshot = snapshot(
            r#"{
                "upstreams": [{"name": "api", "backends": [{"host": "h", "port": 81}]}],
                "routes": [
                    {"path": "/open", "upstream": "api"},
                    {"path": "/locked", "upstream": "api", "required_scopes": ["admin"]}
                ]
            }"#,
        );
        let gateway = build_gateway(snapshot, &GatewayDeps::default()).unwrap();
        assert!(!gateway.pipeline(0).unwrap().stage_names().contains(&"authz"));
        assert!(gateway.pipeline(1).unwrap().stage_names().contains(&"authz"));
    }

    #[test]
    fn backend_slots_are_assigned_in_config_order() {
        let config = parse_config(
            r#"{
                "upstreams": [
                    {"name": "a", "backends": [{"host": "h1", "port": 81}, {"host": "h2", "port": 82}]},
                    {"name": "b", "backends": [{"host": "h3", "port": 83}]}
                ]
            }"#,
        )
        .unwrap();
        // Two independent builds (as two workers would do) produce the
        // same registration order and thus the same slots.
        let first = build_upstream_manager(&config);
        let second = build_upstream_manager(&config);
        let names = |m: &UpstreamManager| {
            m.upstreams()
                .iter()
                .flat_map(|u| u.backends().iter().map(|b| b.address()))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn route_timeout_and_rewrite_are_exposed() {
        let snapshot = snapshot(
            r#"{
                "upstreams": [{"name": "api", "backends": [{"host": "h", "port": 81}]}],
                "routes": [{
                    "path": "/slow",
                    "upstream": "api",
                    "timeout": 1500,
                    "rewrite_path": "/internal/slow"
                }]
            }"#,
        );
        let gateway = build_gateway(snapshot, &GatewayDeps::default()).unwrap();
        assert_eq!(gateway.route_timeout(0), Some(Duration::from_millis(1500)));
        assert_eq!(gateway.route_rewrite(0), Some("/internal/slow"));
        assert_eq!(gateway.route_timeout(5), None);
    }
}
