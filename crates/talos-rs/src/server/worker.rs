//! Per-worker runtime: one OS thread, one current-thread tokio runtime,
//! one accept loop.
//!
//! Each worker owns its listener (SO_REUSEPORT), its connections, its
//! pools, and its pipelines. The worker checks the config store's
//! generation when a request asks for the gateway view and rebuilds its
//! own state on change; in-flight exchanges keep the `Rc` of the
//! snapshot they started with.

use crate::config::store::ConfigStore;
use crate::gateway::factory::{build_gateway, GatewayDeps, GatewaySnapshot};
use crate::models::error::GatewayError;
use crate::server::conn::handle_connection;
use crate::server::tls::build_acceptor;
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

/// Interval for pool maintenance (stale connection eviction).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Worker-owned state shared by that worker's connection tasks.
pub struct WorkerContext {
    pub id: usize,
    store: Arc<ConfigStore>,
    deps: GatewayDeps,
    gateway: RefCell<Rc<GatewaySnapshot>>,
    tls: RefCell<Option<TlsAcceptor>>,
    shutdown: watch::Receiver<bool>,
    active: Cell<usize>,
}

impl WorkerContext {
    fn new(
        id: usize,
        store: Arc<ConfigStore>,
        deps: GatewayDeps,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Rc<Self>, GatewayError> {
        let snapshot = store.get();
        let tls = build_acceptor(&snapshot.config.server)?;
        let gateway = build_gateway(snapshot, &deps)?;
        Ok(Rc::new(WorkerContext {
            id,
            store,
            deps,
            gateway: RefCell::new(Rc::new(gateway)),
            tls: RefCell::new(tls),
            shutdown,
            active: Cell::new(0),
        }))
    }

    /// The current gateway view, rebuilt when a new config generation
    /// was published. A failed rebuild keeps the previous view live.
    pub fn gateway(&self) -> Rc<GatewaySnapshot> {
        let live_generation = self.store.generation();
        if live_generation != self.gateway.borrow().generation() {
            let snapshot = self.store.get();
            match build_gateway(snapshot.clone(), &self.deps) {
                Ok(rebuilt) => {
                    match build_acceptor(&snapshot.config.server) {
                        Ok(acceptor) => *self.tls.borrow_mut() = acceptor,
                        Err(error) => {
                            warn!("worker {}: TLS rebuild failed, keeping previous acceptor: {error}", self.id);
                        }
                    }
                    info!(
                        "worker {}: switched to config generation {}",
                        self.id, snapshot.generation
                    );
                    *self.gateway.borrow_mut() = Rc::new(rebuilt);
                }
                Err(rebuild_error) => {
                    warn!(
                        "worker {}: gateway rebuild failed, keeping generation {}: {rebuild_error}",
                        self.id,
                        self.gateway.borrow().generation()
                    );
                }
            }
        }
        self.gateway.borrow().clone()
    }

    pub fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        // Refreshes alongside the gateway view.
        let _ = self.gateway();
        self.tls.borrow().clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.get()
    }

    /// RAII accounting for one client connection.
    pub fn connection_guard(self: &Rc<Self>) -> ConnectionGuard {
        self.active.set(self.active.get() + 1);
        ConnectionGuard {
            worker: self.clone(),
        }
    }
}

pub struct ConnectionGuard {
    worker: Rc<WorkerContext>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.worker.active.get();
        self.worker.active.set(active.saturating_sub(1));
    }
}

/// Spawns one worker thread running its own accept loop.
pub fn spawn_worker(
    id: usize,
    listener: std::net::TcpListener,
    store: Arc<ConfigStore>,
    deps: GatewayDeps,
    shutdown: watch::Receiver<bool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("talos-worker-{id}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("worker runtime");
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                if let Err(worker_error) = worker_main(id, listener, store, deps, shutdown).await {
                    error!("worker {id} exited with error: {worker_error}");
                }
            });
        })
        .expect("spawn worker thread")
}

async fn worker_main(
    id: usize,
    listener: std::net::TcpListener,
    store: Arc<ConfigStore>,
    deps: GatewayDeps,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    listener
        .set_nonblocking(true)
        .map_err(GatewayError::BindFailed)?;
    let listener = tokio::net::TcpListener::from_std(listener).map_err(GatewayError::BindFailed)?;

    let worker = WorkerContext::new(id, store, deps, shutdown.clone())?;
    info!("worker {id} listening");

    // Background pool maintenance for this worker's upstreams.
    let maintenance = worker.clone();
    tokio::task::spawn_local(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if maintenance.is_shutting_down() {
                break;
            }
            maintenance.gateway().upstreams.cleanup_stale_pools();
        }
    });

    let mut shutdown_rx = shutdown;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let max = worker.gateway().config.config.server.max_connections as usize;
                        if worker.active_connections() >= max {
                            // Over the ceiling: shed the connection.
                            warn!("worker {id}: connection limit {max} reached, dropping {peer}");
                            drop(stream);
                            continue;
                        }
                        debug!("worker {id}: accepted {peer}");
                        let worker = worker.clone();
                        tokio::task::spawn_local(handle_connection(stream, peer, worker));
                    }
                    Err(accept_error) => {
                        // Accept errors are logged and the loop continues.
                        warn!("worker {id}: accept failed: {accept_error}");
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Cooperative drain: stop accepting, let in-flight requests finish
    // until the shutdown timeout, then drop whatever remains.
    let timeout = worker.gateway().config.config.server.shutdown_timeout();
    let deadline = Instant::now() + timeout;
    while worker.active_connections() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(
        "worker {id} drained ({} connection(s) remaining)",
        worker.active_connections()
    );
    Ok(())
}
