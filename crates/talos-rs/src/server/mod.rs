//! The listening server: socket setup, worker threads, and the client
//! connection drivers.
//!
//! - [`conn`] - per-connection protocol loops (HTTP/1.1, HTTP/2, WS)
//! - [`proxy`] - the terminal backend dispatch
//! - [`worker`] - thread-per-core accept loops
//! - [`tls`] - rustls acceptor construction

pub mod conn;
pub mod proxy;
pub mod tls;
pub mod worker;

use crate::config::store::ConfigStore;
use crate::gateway::factory::GatewayDeps;
use crate::models::error::GatewayError;
use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// File-descriptor target for high-connection deployments.
const FD_LIMIT_TARGET: u64 = 65_536;

/// The running gateway: N worker threads sharing one config store.
pub struct GatewayServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl GatewayServer {
    /// Binds the listeners and spawns the workers.
    ///
    /// The first listener resolves the port (so `listen_port: 0` works
    /// in tests); the remaining workers bind the resolved address with
    /// SO_REUSEPORT so the kernel spreads accepts across them.
    pub fn start(store: Arc<ConfigStore>, deps: GatewayDeps) -> Result<GatewayServer, GatewayError> {
        if !store.is_loaded() {
            return Err(GatewayError::ConfigInvalid(
                "no configuration loaded".to_string(),
            ));
        }
        raise_fd_limit();

        let snapshot = store.get();
        let server = &snapshot.config.server;
        let worker_count = snapshot.config.effective_workers();

        // Surface certificate problems before any worker spawns.
        tls::build_acceptor(server)?;

        let addr: SocketAddr = format!("{}:{}", server.listen_address, server.listen_port)
            .parse()
            .map_err(|e| {
                GatewayError::ConfigInvalid(format!(
                    "invalid listen address {}: {e}",
                    server.listen_address
                ))
            })?;

        let reuse_port = worker_count > 1;
        let first = create_listener(addr, server.backlog, reuse_port)?;
        let local_addr = first.local_addr().map_err(GatewayError::BindFailed)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(worker_count);
        workers.push(worker::spawn_worker(
            0,
            first,
            store.clone(),
            deps.clone(),
            shutdown_rx.clone(),
        ));
        for id in 1..worker_count {
            let listener = create_listener(local_addr, server.backlog, true)?;
            workers.push(worker::spawn_worker(
                id,
                listener,
                store.clone(),
                deps.clone(),
                shutdown_rx.clone(),
            ));
        }

        info!(
            "talos gateway listening on {local_addr} with {worker_count} worker(s) (tls: {})",
            server.tls_enabled
        );
        Ok(GatewayServer {
            local_addr,
            shutdown: shutdown_tx,
            workers,
        })
    }

    /// The bound address (with the real port when 0 was configured).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals shutdown and joins the workers; each worker stops
    /// accepting, drains in-flight requests until `shutdown_timeout`,
    /// and exits.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers {
            let _ = handle.join();
        }
        info!("talos gateway stopped");
    }
}

/// Creates a listening socket with the configured backlog and address
/// reuse flags.
fn create_listener(
    addr: SocketAddr,
    backlog: u32,
    reuse_port: bool,
) -> Result<std::net::TcpListener, GatewayError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(GatewayError::BindFailed)?;
    socket
        .set_reuse_address(true)
        .map_err(GatewayError::BindFailed)?;
    #[cfg(unix)]
    if reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(GatewayError::BindFailed)?;
    }
    socket.bind(&addr.into()).map_err(GatewayError::BindFailed)?;
    socket
        .listen(backlog as i32)
        .map_err(GatewayError::BindFailed)?;
    Ok(socket.into())
}

/// Raises the soft file-descriptor limit toward the target. Best
/// effort: deployments pin the real limit via the service manager.
fn raise_fd_limit() {
    #[cfg(unix)]
    unsafe {
        let mut limits = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limits) != 0 {
            return;
        }
        let target = FD_LIMIT_TARGET.min(limits.rlim_max);
        if limits.rlim_cur >= target {
            return;
        }
        limits.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limits) != 0 {
            debug!("could not raise RLIMIT_NOFILE to {target}");
        }
    }
}
