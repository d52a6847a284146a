//! Load balancing policies for distributing requests across backends.
//!
//! A policy picks among the *available* candidates the upstream already
//! filtered (healthy-or-degraded status, breaker admits, under the
//! per-backend connection cap). Selection returns an index into the
//! upstream's backend vector.

use crate::gateway::upstream::Backend;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Policy tags accepted in upstream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Even circular distribution (default).
    #[default]
    RoundRobin,
    /// Backend with the fewest active connections.
    LeastConnections,
    /// Uniform random selection.
    Random,
    /// Round robin over a virtual pool expanded by weights.
    WeightedRoundRobin,
    /// Stable client-IP hash for sticky sessions.
    IpHash,
}

impl LoadBalancingPolicy {
    /// Parses a policy tag, used by config validation.
    pub fn parse(tag: &str) -> Option<LoadBalancingPolicy> {
        match tag {
            "round_robin" => Some(LoadBalancingPolicy::RoundRobin),
            "least_connections" => Some(LoadBalancingPolicy::LeastConnections),
            "random" => Some(LoadBalancingPolicy::Random),
            "weighted_round_robin" => Some(LoadBalancingPolicy::WeightedRoundRobin),
            "ip_hash" => Some(LoadBalancingPolicy::IpHash),
            _ => None,
        }
    }
}

/// Backend selection strategy.
pub trait LoadBalancer: std::fmt::Debug {
    /// Picks one of `candidates` (indices into `backends`), or `None`
    /// when the candidate set is empty.
    fn select(
        &self,
        backends: &[Backend],
        candidates: &[usize],
        client_ip: Option<&str>,
    ) -> Option<usize>;
}

/// Round-robin balancer backed by an atomic counter.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(
        &self,
        _backends: &[Backend],
        candidates: &[usize],
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let slot = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[slot])
    }
}

/// Picks the candidate with the fewest active connections.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(
        &self,
        backends: &[Backend],
        candidates: &[usize],
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        candidates
            .iter()
            .copied()
            .min_by_key(|&i| backends[i].active_connections())
    }
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(
        &self,
        _backends: &[Backend],
        candidates: &[usize],
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let slot = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[slot])
    }
}

/// Weighted round robin via virtual-pool expansion.
///
/// A candidate with weight N occupies N consecutive slots of the
/// virtual pool, so the distribution over one full cycle equals the
/// configured weights.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(
        &self,
        backends: &[Backend],
        candidates: &[usize],
        _client_ip: Option<&str>,
    ) -> Option<usize> {
        let total: usize = candidates
            .iter()
            .map(|&i| backends[i].weight.max(1) as usize)
            .sum();
        if total == 0 {
            return None;
        }
        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for &index in candidates {
            let weight = backends[index].weight.max(1) as usize;
            if slot < weight {
                return Some(index);
            }
            slot -= weight;
        }
        None
    }
}

/// Stable hash of the client IP selecting a candidate.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    fn hash_ip(ip: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancer for IpHashBalancer {
    fn select(
        &self,
        _backends: &[Backend],
        candidates: &[usize],
        client_ip: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        match client_ip {
            Some(ip) => {
                let slot = (Self::hash_ip(ip) as usize) % candidates.len();
                Some(candidates[slot])
            }
            // No client hint: fall back to the first candidate.
            None => Some(candidates[0]),
        }
    }
}

/// Creates a balancer instance for the given policy tag.
pub fn create_balancer(policy: LoadBalancingPolicy) -> Box<dyn LoadBalancer> {
    match policy {
        LoadBalancingPolicy::RoundRobin => Box::<RoundRobinBalancer>::default(),
        LoadBalancingPolicy::LeastConnections => Box::<LeastConnectionsBalancer>::default(),
        LoadBalancingPolicy::Random => Box::<RandomBalancer>::default(),
        LoadBalancingPolicy::WeightedRoundRobin => Box::<WeightedRoundRobinBalancer>::default(),
        LoadBalancingPolicy::IpHash => Box::<IpHashBalancer>::default(),
    }
}
