//! Hot-reloadable configuration store with read-copy-update semantics.
//!
//! Readers grab a cheap `Arc` handle to the current immutable snapshot;
//! there is no lock on the read path. Publishers parse and validate the
//! whole file first and only then swap the pointer, so a failed reload
//! never disturbs the live snapshot. A request that cloned snapshot N
//! keeps it alive (and keeps seeing N) even if N+1 is published while
//! the request is in flight.

use crate::config::settings::{load_config, Config};
use crate::config::validation::ConfigValidator;
use crate::models::error::GatewayError;
use arc_swap::ArcSwap;
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// An immutable, validated configuration with its generation number.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: Config,
    /// Monotonically increasing; workers compare it to detect reloads.
    pub generation: u64,
}

/// The shared configuration cell.
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    path: RwLock<String>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("generation", &self.generation())
            .finish()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Creates a store holding an empty default configuration
    /// (generation 0, meaning nothing was loaded yet).
    pub fn new() -> Self {
        ConfigStore {
            current: ArcSwap::from_pointee(ConfigSnapshot {
                config: Config::default(),
                generation: 0,
            }),
            path: RwLock::new(String::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a store from an in-memory configuration, validating it
    /// first. Used by embedders and tests that skip the file system.
    pub fn from_config(config: Config) -> Result<Self, GatewayError> {
        let store = Self::new();
        store.publish(config)?;
        Ok(store)
    }

    /// Loads, validates, and publishes a configuration file.
    pub fn load(&self, path: &str) -> Result<(), GatewayError> {
        let config = load_config(path)?;
        self.publish(config)?;
        *self.path.write().expect("config path lock") = path.to_string();
        info!("configuration loaded from {path}");
        Ok(())
    }

    /// Re-runs `load` against the previously loaded path.
    ///
    /// On failure the previous snapshot stays live.
    pub fn reload(&self) -> Result<(), GatewayError> {
        let path = self.path.read().expect("config path lock").clone();
        if path.is_empty() {
            return Err(GatewayError::ConfigInvalid(
                "reload without a previously loaded path".to_string(),
            ));
        }
        match load_config(&path).and_then(|config| self.publish(config)) {
            Ok(()) => {
                info!(
                    "configuration reloaded from {path} (generation {})",
                    self.generation()
                );
                Ok(())
            }
            Err(error) => {
                warn!("configuration reload failed, keeping previous snapshot: {error}");
                Err(error)
            }
        }
    }

    /// Validates and atomically publishes a new snapshot.
    fn publish(&self, config: Config) -> Result<(), GatewayError> {
        let result = ConfigValidator::validate(&config);
        if !result.is_valid {
            return Err(GatewayError::ConfigInvalid(result.errors.join("; ")));
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.current.store(Arc::new(ConfigSnapshot { config, generation }));
        Ok(())
    }

    /// The current snapshot. The returned handle keeps it alive for as
    /// long as the caller holds it, across any number of reloads.
    pub fn get(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Generation of the live snapshot; 0 before the first load.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.generation() > 0
    }
}
