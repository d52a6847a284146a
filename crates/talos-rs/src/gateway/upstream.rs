//! Upstream groups: named sets of backends with load balancing, pooled
//! connections, and per-backend failure handling.
//!
//! An `UpstreamManager` (and everything under it) is owned by a single
//! worker and rebuilt from each config snapshot. Backend hint slots are
//! assigned deterministically from config order, so every worker maps
//! the same backend to the same global circuit-breaker hint.

use crate::gateway::circuit_breaker::CircuitBreaker;
use crate::gateway::load_balancer::LoadBalancer;
use crate::gateway::pool::{BackendConnectionPool, PoolStats};
use ahash::HashMap as AHashMap;
use ahash::HashMapExt;
use log::{info, warn};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Consecutive transport failures that demote a backend to Unhealthy.
const PASSIVE_UNHEALTHY_THRESHOLD: u32 = 3;

/// Backend availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Excluded from new selections during graceful removal.
    Draining,
}

/// One origin server inside an upstream.
#[derive(Debug)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: u32,
    status: Cell<BackendStatus>,
    active_connections: Cell<u32>,
    consecutive_failures: Cell<u32>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    /// Optional breaker; present when the upstream enables one.
    pub breaker: Option<CircuitBreaker>,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Backend {
            host: host.into(),
            port,
            weight: 1,
            max_connections: 1000,
            status: Cell::new(BackendStatus::Healthy),
            active_connections: Cell::new(0),
            consecutive_failures: Cell::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            breaker: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn status(&self) -> BackendStatus {
        self.status.get()
    }

    pub fn set_status(&self, status: BackendStatus) {
        self.status.set(status);
    }

    /// Healthy or Degraded backends participate in selection.
    pub fn is_available(&self) -> bool {
        matches!(
            self.status.get(),
            BackendStatus::Healthy | BackendStatus::Degraded
        )
    }

    pub fn can_accept_connection(&self) -> bool {
        self.is_available() && self.active_connections.get() < self.max_connections
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.get()
    }

    pub fn incr_active(&self) {
        self.active_connections.set(self.active_connections.get() + 1);
    }

    pub fn decr_active(&self) {
        let current = self.active_connections.get();
        self.active_connections.set(current.saturating_sub(1));
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }
}

/// Aggregated view over one upstream, for the stats surface.
#[derive(Debug, Clone)]
pub struct UpstreamStats {
    pub name: String,
    pub total_backends: usize,
    pub healthy_backends: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub pool: PoolStats,
}

/// A named backend group with its balancer and per-worker pool.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    backends: Vec<Backend>,
    balancer: Box<dyn LoadBalancer>,
    pool: RefCell<BackendConnectionPool>,
    pub max_retries: u32,
    pub retry_timeout: Duration,
}

impl Upstream {
    pub fn new(
        name: impl Into<String>,
        balancer: Box<dyn LoadBalancer>,
        pool_size: usize,
        pool_idle_timeout: Duration,
    ) -> Self {
        Upstream {
            name: name.into(),
            backends: Vec::new(),
            balancer,
            pool: RefCell::new(BackendConnectionPool::new(pool_size, pool_idle_timeout)),
            max_retries: 2,
            retry_timeout: Duration::from_millis(1000),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_backend(&mut self, backend: Backend) {
        info!(
            "upstream {}: registered backend {} (weight {})",
            self.name,
            backend.address(),
            backend.weight
        );
        self.backends.push(backend);
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn backend(&self, index: usize) -> Option<&Backend> {
        self.backends.get(index)
    }

    /// Worker-local idle connection pool for this upstream.
    pub fn pool(&self) -> &RefCell<BackendConnectionPool> {
        &self.pool
    }

    /// Selects an available backend for a new request.
    ///
    /// Available means Healthy or Degraded, under the connection cap,
    /// and admitted by the circuit breaker when one is configured. The
    /// active-connection counter of the chosen backend is incremented;
    /// the caller must pair it with [`Upstream::record_success`] or
    /// [`Upstream::record_failure`].
    pub fn select_backend(&self, client_ip: Option<&str>) -> Option<usize> {
        let candidates: Vec<usize> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.can_accept_connection()
                    && b.breaker
                        .as_ref()
                        .map(|cb| cb.should_allow_request())
                        .unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();

        let index = self.balancer.select(&self.backends, &candidates, client_ip)?;
        let backend = &self.backends[index];
        backend.incr_active();
        backend.total_requests.fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// Records a completed exchange with a backend.
    pub fn record_success(&self, index: usize) {
        if let Some(backend) = self.backends.get(index) {
            backend.decr_active();
            backend.consecutive_failures.set(0);
            if backend.status.get() == BackendStatus::Unhealthy {
                info!(
                    "upstream {}: backend {} recovered",
                    self.name,
                    backend.address()
                );
                backend.status.set(BackendStatus::Healthy);
            }
            if let Some(breaker) = &backend.breaker {
                breaker.record_success();
            }
        }
    }

    /// Records a failed exchange; consecutive failures demote the
    /// backend to Unhealthy so selection skips it.
    pub fn record_failure(&self, index: usize) {
        if let Some(backend) = self.backends.get(index) {
            backend.decr_active();
            backend.total_failures.fetch_add(1, Ordering::Relaxed);
            let failures = backend.consecutive_failures.get() + 1;
            backend.consecutive_failures.set(failures);
            if failures >= PASSIVE_UNHEALTHY_THRESHOLD
                && backend.status.get() != BackendStatus::Unhealthy
            {
                warn!(
                    "upstream {}: backend {} marked unhealthy after {} consecutive failures",
                    self.name,
                    backend.address(),
                    failures
                );
                backend.status.set(BackendStatus::Unhealthy);
            }
            if let Some(breaker) = &backend.breaker {
                breaker.record_failure();
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_available()).count()
    }

    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            name: self.name.clone(),
            total_backends: self.backends.len(),
            healthy_backends: self.healthy_count(),
            total_requests: self.backends.iter().map(|b| b.total_requests()).sum(),
            total_failures: self.backends.iter().map(|b| b.total_failures()).sum(),
            pool: self.pool.borrow().stats(),
        }
    }
}

/// Registry of every upstream in one worker's view of a snapshot.
#[derive(Debug, Default)]
pub struct UpstreamManager {
    upstreams: Vec<Upstream>,
    by_name: AHashMap<String, usize>,
}

impl UpstreamManager {
    pub fn new() -> Self {
        UpstreamManager {
            upstreams: Vec::new(),
            by_name: AHashMap::new(),
        }
    }

    pub fn register_upstream(&mut self, upstream: Upstream) {
        self.by_name
            .insert(upstream.name().to_string(), self.upstreams.len());
        self.upstreams.push(upstream);
    }

    pub fn get(&self, name: &str) -> Option<&Upstream> {
        self.by_name.get(name).map(|&i| &self.upstreams[i])
    }

    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// Runs stale-connection cleanup across every pool.
    pub fn cleanup_stale_pools(&self) {
        for upstream in &self.upstreams {
            upstream.pool().borrow_mut().cleanup_stale();
        }
    }
}
