//! Talos Gateway Server
//!
//! Binary entry point for the Talos reverse proxy: loads and validates
//! the JSON configuration, starts the worker fleet, and handles
//! signal-driven shutdown and hot reload.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration-load failure
//! (before listening) and on unrecoverable bind failure.

use std::sync::Arc;

use log::{error, info, warn};
use talos_rs::config::store::ConfigStore;
use talos_rs::gateway::factory::GatewayDeps;
use talos_rs::logs::logger::configure_logger;
use talos_rs::server::GatewayServer;
use tokio::signal;

#[tokio::main]
async fn main() {
    let config_path =
        std::env::var("TALOS_CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());

    // Load before the logger so the configured level applies from the
    // first line; parse errors fall back to the default format.
    let store = Arc::new(ConfigStore::new());
    if let Err(load_error) = store.load(&config_path) {
        configure_logger("info");
        error!("failed to load configuration from {config_path}: {load_error}");
        std::process::exit(1);
    }

    let snapshot = store.get();
    configure_logger(&snapshot.config.logging.level);
    info!(
        "starting talos gateway v{} ({} route(s), {} upstream(s))",
        env!("CARGO_PKG_VERSION"),
        snapshot.config.routes.len(),
        snapshot.config.upstreams.len()
    );
    drop(snapshot);

    let server = match GatewayServer::start(store.clone(), GatewayDeps::default()) {
        Ok(server) => server,
        Err(bind_error) => {
            error!("failed to start: {bind_error}");
            std::process::exit(1);
        }
    };
    info!("listening on {}", server.local_addr());

    // SIGHUP reloads the configuration; ctrl-c / SIGTERM drain and exit.
    #[cfg(unix)]
    {
        let mut sighup =
            signal::unix::signal(signal::unix::SignalKind::hangup()).expect("install SIGHUP");
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).expect("install SIGTERM");
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    match store.reload() {
                        Ok(()) => info!("configuration reloaded (generation {})", store.generation()),
                        Err(reload_error) => warn!("reload rejected: {reload_error}"),
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
    }

    server.shutdown();
}
