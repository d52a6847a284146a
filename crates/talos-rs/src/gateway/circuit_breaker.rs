//! Circuit breaker with sliding-window failure accounting.
//!
//! Each backend of an upstream carries its own breaker. The failure
//! window is mutated only by the worker that owns the upstream, so it
//! needs no synchronization; the lifetime counters are atomic so other
//! workers (and the metrics surface) can read them. A fixed-size array
//! of atomic flags carries the catastrophic hint across workers: once a
//! backend's failure rate passes `catastrophic_threshold`, every worker
//! short-circuits without waiting for its own window to fill.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use log::{info, warn};

/// Upper bound of backends participating in global hints. Ids are handed
/// out by the upstream manager at registration time.
pub const MAX_BACKENDS: usize = 1024;

static GLOBAL_BACKEND_DOWN: [AtomicBool; MAX_BACKENDS] =
    [const { AtomicBool::new(false) }; MAX_BACKENDS];

/// State of a circuit breaker.
///
/// * `Closed` - normal operation, requests pass through
/// * `Open` - circuit tripped, requests fail fast
/// * `HalfOpen` - probing recovery with a limited number of requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration parameters for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window required to open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen required to close it again.
    pub success_threshold: u32,
    /// Time spent Open before the next request probes recovery.
    pub timeout: Duration,
    /// Width of the sliding failure window.
    pub window: Duration,
    /// Whether this breaker participates in cross-worker hints.
    pub enable_global_hints: bool,
    /// Window length that sets the process-wide backend-down flag.
    pub catastrophic_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_millis(30_000),
            window: Duration::from_millis(10_000),
            enable_global_hints: true,
            catastrophic_threshold: 20,
        }
    }
}

/// Monotonic counters readable from other workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub total_failures: u64,
    pub total_successes: u64,
    pub rejected_requests: u64,
    pub state_transitions: u64,
}

/// Per-backend circuit breaker.
///
/// Owned by one worker; `state` and the counters are atomics purely for
/// observability reads from elsewhere.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_window: RefCell<VecDeque<Instant>>,
    consecutive_successes: Cell<u32>,
    transition_time: Cell<Instant>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    rejected_requests: AtomicU64,
    state_transitions: AtomicU64,
    /// Slot in the global hint array; `None` opts out of hints.
    backend_id: Option<usize>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_window: RefCell::new(VecDeque::new()),
            consecutive_successes: Cell::new(0),
            transition_time: Cell::new(Instant::now()),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            backend_id: None,
        }
    }

    /// Attaches the breaker to a global-hint slot.
    pub fn with_backend_id(mut self, backend_id: usize) -> Self {
        if backend_id < MAX_BACKENDS {
            self.backend_id = Some(backend_id);
        }
        self
    }

    /// Decides whether a request may proceed.
    ///
    /// In `Open`, the first call after `timeout` has elapsed transitions
    /// to `HalfOpen` and is admitted as the recovery probe.
    pub fn should_allow_request(&self) -> bool {
        if self.config.enable_global_hints && self.is_global_backend_down() {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => self.try_half_open(),
        }
    }

    /// Records a successful backend exchange.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.consecutive_successes.get() + 1;
            self.consecutive_successes.set(successes);

            if successes >= self.config.success_threshold {
                self.transition_to(CircuitState::Closed);
                self.consecutive_successes.set(0);
                self.failure_window.borrow_mut().clear();
                if self.config.enable_global_hints {
                    self.clear_global_backend_down();
                }
                info!("circuit breaker half-open -> closed (recovery confirmed)");
            }
        }
    }

    /// Records a failed backend exchange.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        {
            let mut window = self.failure_window.borrow_mut();
            window.push_back(now);
            let cutoff = now - self.config.window;
            while window.front().is_some_and(|t| *t < cutoff) {
                window.pop_front();
            }
        }

        match self.state() {
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
                self.consecutive_successes.set(0);
                warn!("circuit breaker half-open -> open (probe failed)");
            }
            CircuitState::Closed => {
                let window_len = self.failure_window.borrow().len() as u32;
                if window_len >= self.config.failure_threshold {
                    self.transition_to(CircuitState::Open);
                    info!(
                        "circuit breaker closed -> open ({} failures in {:?} window)",
                        window_len, self.config.window
                    );
                }
                if self.config.enable_global_hints
                    && window_len >= self.config.catastrophic_threshold
                {
                    self.set_global_backend_down();
                    warn!(
                        "circuit breaker raised catastrophic hint ({} failures)",
                        window_len
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker open regardless of the window contents.
    pub fn force_open(&self) {
        if self.state() != CircuitState::Open {
            self.transition_to(CircuitState::Open);
            info!("circuit breaker forced open");
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }

    /// Current number of failures inside the sliding window.
    pub fn failure_window_len(&self) -> usize {
        self.failure_window.borrow().len()
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old = self.state.swap(new_state as u8, Ordering::AcqRel);
        if old != new_state as u8 {
            self.transition_time.set(Instant::now());
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn try_half_open(&self) -> bool {
        if self.transition_time.get().elapsed() >= self.config.timeout {
            let result = self.state.compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if result.is_ok() {
                self.transition_time.set(Instant::now());
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                self.consecutive_successes.set(0);
                info!("circuit breaker open -> half-open (probing recovery)");
                return true;
            }
        }
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        false
    }

    fn is_global_backend_down(&self) -> bool {
        self.backend_id
            .map(|id| GLOBAL_BACKEND_DOWN[id].load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    fn set_global_backend_down(&self) {
        if let Some(id) = self.backend_id {
            GLOBAL_BACKEND_DOWN[id].store(true, Ordering::Release);
        }
    }

    fn clear_global_backend_down(&self) {
        if let Some(id) = self.backend_id {
            GLOBAL_BACKEND_DOWN[id].store(false, Ordering::Release);
        }
    }
}

/// Reads the process-wide backend-down hint for a slot.
pub fn backend_hint_set(backend_id: usize) -> bool {
    backend_id < MAX_BACKENDS && GLOBAL_BACKEND_DOWN[backend_id].load(Ordering::Relaxed)
}

/// Clears the process-wide backend-down hint for a slot.
///
/// Called by the health surface when a backend is confirmed reachable
/// again, so workers do not stay short-circuited on a stale hint.
pub fn clear_backend_hint(backend_id: usize) {
    if backend_id < MAX_BACKENDS {
        GLOBAL_BACKEND_DOWN[backend_id].store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(100),
            window: Duration::from_millis(10_000),
            enable_global_hints: false,
            catastrophic_threshold: 20,
        }
    }

    #[test]
    fn opens_after_threshold_failures_in_window() {
        let breaker = CircuitBreaker::new(fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_and_counts() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(!breaker.should_allow_request());
        assert_eq!(breaker.stats().rejected_requests, 1);
    }

    #[test]
    fn recovery_cycle_closes_circuit_and_clears_window() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow_request());

        std::thread::sleep(Duration::from_millis(150));

        // Exactly one probe is admitted and moves the state to HalfOpen.
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_window_len(), 0);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(breaker.should_allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn window_evicts_old_failures() {
        let config = CircuitBreakerConfig {
            window: Duration::from_millis(50),
            ..fast_config()
        };
        let breaker = CircuitBreaker::new(config);
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(80));
        // Old entries fall out; this one failure is not enough to open.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_window_len(), 1);
    }

    #[test]
    fn catastrophic_hint_blocks_other_breakers_on_same_backend() {
        let config = CircuitBreakerConfig {
            failure_threshold: 100,
            catastrophic_threshold: 3,
            enable_global_hints: true,
            ..fast_config()
        };
        // Same slot, as two workers would configure for one backend.
        let first = CircuitBreaker::new(config.clone()).with_backend_id(900);
        let second = CircuitBreaker::new(config).with_backend_id(900);

        for _ in 0..3 {
            first.record_failure();
        }
        assert!(backend_hint_set(900));
        // The second worker's breaker short-circuits on the hint alone,
        // even though its own window is empty.
        assert!(!second.should_allow_request());
        assert_eq!(second.failure_window_len(), 0);

        // The health surface confirms recovery and clears the hint.
        clear_backend_hint(900);
        assert!(first.should_allow_request());
        assert!(second.should_allow_request());
    }

    #[test]
    fn counters_are_monotonic() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        let stats = breaker.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.total_failures, 2);
    }
}
