//! Per-worker backend connection pool.
//!
//! A LIFO stack of idle keep-alive connections keyed by (host, port).
//! LIFO keeps the most recently used socket on top for cache locality
//! and gives idle sockets at the bottom a chance to age out. The pool is
//! worker-local: no locks, no cross-worker sharing.

use futures_util::FutureExt;
use log::debug;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// An idle backend connection parked in the pool.
#[derive(Debug)]
pub struct PooledConnection {
    pub stream: TcpStream,
    pub host: String,
    pub port: u16,
    pub created_at: Instant,
    pub last_used: Instant,
    pub requests_served: u64,
}

impl PooledConnection {
    pub fn new(stream: TcpStream, host: impl Into<String>, port: u16) -> Self {
        let now = Instant::now();
        PooledConnection {
            stream,
            host: host.into(),
            port,
            created_at: now,
            last_used: now,
            requests_served: 0,
        }
    }

    /// Cheap liveness probe without consuming data.
    ///
    /// A readable socket that yields zero bytes is a peer-closed
    /// CLOSE_WAIT and is dead; would-block means idle and usable; data
    /// sitting on an idle pooled connection or any error means broken.
    pub fn is_healthy(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe).now_or_never() {
            None => true,
            Some(Ok(0)) => false,
            Some(Ok(_)) => false,
            Some(Err(_)) => false,
        }
    }
}

/// Pool counters, exposed through the stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle_connections: usize,
    pub hits: u64,
    pub misses: u64,
    pub health_check_failures: u64,
    pub pool_full_closes: u64,
}

/// LIFO connection pool for one upstream on one worker.
#[derive(Debug)]
pub struct BackendConnectionPool {
    entries: Vec<PooledConnection>,
    max_size: usize,
    max_idle: Duration,
    /// Connections idle longer than this are probed before reuse;
    /// recently used ones are trusted (send failure triggers the
    /// reconnect path instead).
    validate_after_idle: Duration,
    hits: u64,
    misses: u64,
    health_check_failures: u64,
    pool_full_closes: u64,
}

impl BackendConnectionPool {
    pub fn new(max_size: usize, max_idle: Duration) -> Self {
        BackendConnectionPool {
            entries: Vec::with_capacity(max_size.min(64)),
            max_size,
            max_idle,
            validate_after_idle: Duration::from_secs(5),
            hits: 0,
            misses: 0,
            health_check_failures: 0,
            pool_full_closes: 0,
        }
    }

    /// Overrides the idle threshold after which reuse requires a probe.
    pub fn with_validate_after_idle(mut self, threshold: Duration) -> Self {
        self.validate_after_idle = threshold;
        self
    }

    /// Pops the most recently used healthy connection for (host, port).
    pub fn acquire(&mut self, host: &str, port: u16) -> Option<PooledConnection> {
        // Walk from the top of the stack.
        let mut index = self.entries.len();
        while index > 0 {
            index -= 1;
            if self.entries[index].host != host || self.entries[index].port != port {
                continue;
            }

            let mut conn = self.entries.remove(index);
            let needs_probe = conn.last_used.elapsed() > self.validate_after_idle;
            if needs_probe && !conn.is_healthy() {
                self.health_check_failures += 1;
                debug!("pool: dropping dead connection to {}:{}", host, port);
                continue;
            }
            conn.last_used = Instant::now();
            self.hits += 1;
            return Some(conn);
        }
        self.misses += 1;
        None
    }

    /// Returns a connection to the pool, or closes it when the pool is
    /// full or the socket is no longer usable.
    pub fn release(&mut self, mut conn: PooledConnection) {
        if self.entries.len() >= self.max_size {
            self.pool_full_closes += 1;
            return;
        }
        if !conn.is_healthy() {
            self.health_check_failures += 1;
            return;
        }
        conn.last_used = Instant::now();
        self.entries.push(conn);
    }

    /// Closes and removes entries idle longer than `max_idle`.
    ///
    /// Calling this on a pool with no stale entries is a no-op.
    pub fn cleanup_stale(&mut self) {
        let max_idle = self.max_idle;
        self.entries.retain(|c| c.last_used.elapsed() <= max_idle);
    }

    pub fn idle_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle_connections: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            health_check_failures: self.health_check_failures,
            pool_full_closes: self.pool_full_closes,
        }
    }

    /// Drops every pooled connection.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
