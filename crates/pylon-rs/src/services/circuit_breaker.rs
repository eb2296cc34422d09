//! Circuit breaker implementation for upstream service protection.
//!
//! Each backend service gets an independent three-state machine that fails
//! fast while the service is degraded and probes cautiously while it
//! recovers. The pipeline acquires a permit before routing and reports the
//! upstream outcome after the proxy call completes.

use crate::models::service::CircuitBreakerConfig;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// State of a circuit breaker.
///
/// * `Closed` - normal operation, all requests pass through
/// * `Open` - circuit tripped, requests fail fast without executing
/// * `HalfOpen` - testing recovery, limited concurrent probes allowed
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

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Why a request was refused admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitRejection {
    /// The circuit is open and the reset window has not elapsed.
    Open { retry_after_secs: u64 },
    /// The circuit is half-open and all probe slots are taken.
    HalfOpenSaturated,
}

impl CircuitRejection {
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            CircuitRejection::Open { retry_after_secs } => (*retry_after_secs).max(1),
            CircuitRejection::HalfOpenSaturated => 1,
        }
    }
}

/// Admission token returned by [`CircuitBreaker::try_acquire`].
///
/// Carries whether the request is a half-open probe so the outcome report
/// releases the probe slot. The caller must hand the permit back through
/// `record_success` or `record_failure` exactly once.
#[derive(Debug)]
pub struct CircuitPermit {
    half_open_probe: bool,
}

/// Point-in-time view of one circuit, used by admin and metrics surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: String,
    pub failures: u64,
    pub successes: u64,
    pub timeouts: u64,
}

/// Per-service circuit breaker.
///
/// # Thread Safety
///
/// Hot counters are atomics; the state transition path takes a short write
/// lock so concurrent requests observe a consistent `(state, changed_at)`
/// pair. A single request touches at most one circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    /// Failures and successes accumulated while closed; both reset when the
    /// circuit closes again.
    failures: AtomicU64,
    successes: AtomicU64,
    /// Consecutive successes observed while half-open.
    half_open_successes: AtomicU64,
    /// Probes currently in flight while half-open.
    half_open_in_flight: AtomicU64,
    /// Failures whose cause was an upstream timeout.
    timeouts: AtomicU64,
    changed_at: RwLock<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            half_open_in_flight: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            changed_at: RwLock::new(Instant::now()),
        })
    }

    /// Requests admission for one upstream call.
    ///
    /// Open circuits reject until `reset_timeout` has elapsed since the last
    /// transition; the first request at or past that point flips the circuit
    /// to half-open and becomes a probe. Half-open circuits admit at most
    /// `half_open_requests` concurrent probes.
    pub fn try_acquire(&self) -> Result<CircuitPermit, CircuitRejection> {
        match self.state() {
            CircuitState::Closed => Ok(CircuitPermit { half_open_probe: false }),
            CircuitState::Open => {
                let elapsed = self.changed_at.read().unwrap().elapsed();
                let reset = Duration::from_millis(self.config.reset_timeout_ms);
                if elapsed >= reset {
                    // Only one caller performs the transition; everyone who
                    // arrives after it sees HalfOpen and competes for a slot.
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.note_transition(CircuitState::Open, CircuitState::HalfOpen);
                        self.half_open_successes.store(0, Ordering::SeqCst);
                        self.half_open_in_flight.store(0, Ordering::SeqCst);
                    }
                    self.acquire_half_open_slot()
                } else {
                    let remaining = reset - elapsed;
                    Err(CircuitRejection::Open {
                        retry_after_secs: remaining.as_secs_f64().ceil() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => self.acquire_half_open_slot(),
        }
    }

    fn acquire_half_open_slot(&self) -> Result<CircuitPermit, CircuitRejection> {
        let mut current = self.half_open_in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.config.half_open_requests {
                return Err(CircuitRejection::HalfOpenSaturated);
            }
            match self.half_open_in_flight.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(CircuitPermit { half_open_probe: true }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Reports a successful upstream call.
    pub fn record_success(&self, permit: CircuitPermit) {
        if permit.half_open_probe {
            self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        match self.state() {
            CircuitState::Closed => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.half_open_requests {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                debug!("Unexpected success reported while circuit {} is open", self.name);
            }
        }
    }

    /// Reports a failed upstream call. `timed_out` marks failures caused by
    /// the call exceeding the breaker timeout; these feed a separate counter
    /// for telemetry on top of the normal failure accounting.
    pub fn record_failure(&self, permit: CircuitPermit, timed_out: bool) {
        if permit.half_open_probe {
            self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        if timed_out {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        match self.state() {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                let successes = self.successes.load(Ordering::SeqCst);
                if failures >= self.config.error_count
                    && failure_rate(failures, successes) >= self.config.error_threshold as f64
                {
                    self.transition_to_open(CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen => {
                // A single failed probe reopens the circuit.
                self.transition_to_open(CircuitState::HalfOpen);
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self, from: CircuitState) {
        if self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.note_transition(from, CircuitState::Open);
            self.half_open_successes.store(0, Ordering::SeqCst);
            warn!(
                "Circuit {} opened ({} failures, {:.0}% failure rate)",
                self.name,
                self.failures.load(Ordering::SeqCst),
                failure_rate(
                    self.failures.load(Ordering::SeqCst),
                    self.successes.load(Ordering::SeqCst)
                )
            );
        }
    }

    fn transition_to_closed(&self) {
        if self
            .state
            .compare_exchange(
                CircuitState::HalfOpen as u8,
                CircuitState::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.note_transition(CircuitState::HalfOpen, CircuitState::Closed);
            self.failures.store(0, Ordering::SeqCst);
            self.successes.store(0, Ordering::SeqCst);
            self.half_open_successes.store(0, Ordering::SeqCst);
            info!("Circuit {} closed, service recovered", self.name);
        }
    }

    fn note_transition(&self, from: CircuitState, to: CircuitState) {
        *self.changed_at.write().unwrap() = Instant::now();
        debug!(
            "Circuit {} transition {} -> {}",
            self.name,
            from.as_str(),
            to.as_str()
        );
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Breaker timeout applied to each upstream call.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            service: self.name.clone(),
            state: self.state().as_str().to_string(),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

fn failure_rate(failures: u64, successes: u64) -> f64 {
    let total = failures + successes;
    if total == 0 {
        0.0
    } else {
        failures as f64 / total as f64 * 100.0
    }
}

/// Table of circuits keyed by service name.
///
/// Circuits are created lazily on first use with the global defaults,
/// overridden per service when the descriptor carries its own block.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            overrides,
        }
    }

    /// Derives the circuit key from a request: the second path segment of
    /// `/api/<service>/…`, or the `x-service-name` header. `None` means the
    /// breaker is bypassed for this request.
    pub fn service_key(path: &str, service_header: Option<&str>) -> Option<String> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        if segments.next() == Some("api") {
            if let Some(service) = segments.next() {
                return Some(service.to_string());
            }
        }
        service_header
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    pub fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().unwrap().get(service) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                CircuitBreaker::new(service.to_string(), config)
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .read()
            .unwrap()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(error_count: u64, threshold: u8, reset_ms: u64, half_open: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout_ms: 1000,
            error_count,
            error_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_requests: half_open,
        }
    }

    fn drive_failure(breaker: &CircuitBreaker) {
        let permit = breaker.try_acquire().expect("admission");
        breaker.record_failure(permit, false);
    }

    fn drive_success(breaker: &CircuitBreaker) {
        let permit = breaker.try_acquire().expect("admission");
        breaker.record_success(permit);
    }

    #[test]
    fn test_opens_after_error_count_and_threshold() {
        let breaker = CircuitBreaker::new("users".into(), config(3, 50, 1000, 3));

        drive_failure(&breaker);
        drive_failure(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);

        drive_failure(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_threshold_keeps_circuit_closed_under_low_rate() {
        // 3 failures against 97 successes is 3%, far below 50%.
        let breaker = CircuitBreaker::new("users".into(), config(3, 50, 1000, 3));
        for _ in 0..97 {
            drive_success(&breaker);
        }
        for _ in 0..3 {
            drive_failure(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_with_retry_after() {
        let breaker = CircuitBreaker::new("users".into(), config(1, 1, 5000, 3));
        drive_failure(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        match breaker.try_acquire() {
            Err(rejection) => {
                assert!(rejection.retry_after_secs() >= 1);
                assert!(rejection.retry_after_secs() <= 5);
            }
            Ok(_) => panic!("open circuit admitted a request"),
        }
    }

    #[test]
    fn test_half_open_after_reset_then_closes() {
        let breaker = CircuitBreaker::new("users".into(), config(1, 1, 10, 2));
        drive_failure(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        // First request after the reset window becomes a half-open probe.
        let p1 = breaker.try_acquire().expect("probe admission");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success(p1);

        let p2 = breaker.try_acquire().expect("second probe");
        breaker.record_success(p2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("users".into(), config(1, 1, 10, 3));
        drive_failure(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        let permit = breaker.try_acquire().expect("probe admission");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure(permit, false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_concurrency_budget() {
        let breaker = CircuitBreaker::new("users".into(), config(1, 1, 10, 2));
        drive_failure(&breaker);
        std::thread::sleep(Duration::from_millis(20));

        let p1 = breaker.try_acquire().expect("probe 1");
        let p2 = breaker.try_acquire().expect("probe 2");
        assert_eq!(
            breaker.try_acquire().unwrap_err(),
            CircuitRejection::HalfOpenSaturated
        );

        // Releasing a slot admits the next probe.
        breaker.record_success(p1);
        let p3 = breaker.try_acquire().expect("probe after release");
        breaker.record_success(p2);
        breaker.record_success(p3);
    }

    #[test]
    fn test_timeout_counter() {
        let breaker = CircuitBreaker::new("users".into(), config(10, 100, 1000, 3));
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit, true);
        let permit = breaker.try_acquire().unwrap();
        breaker.record_failure(permit, false);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[test]
    fn test_service_key_derivation() {
        assert_eq!(
            CircuitBreakerRegistry::service_key("/api/users/42", None),
            Some("users".to_string())
        );
        assert_eq!(
            CircuitBreakerRegistry::service_key("/health", Some("payments")),
            Some("payments".to_string())
        );
        assert_eq!(CircuitBreakerRegistry::service_key("/health", None), None);
        assert_eq!(CircuitBreakerRegistry::service_key("/api", None), None);
    }

    #[test]
    fn test_registry_applies_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("users".to_string(), config(1, 1, 1000, 5));
        let registry = CircuitBreakerRegistry::new(config(5, 50, 30_000, 3), overrides);

        let users = registry.breaker_for("users");
        drive_failure(&users);
        assert_eq!(users.state(), CircuitState::Open);

        let orders = registry.breaker_for("orders");
        drive_failure(&orders);
        assert_eq!(orders.state(), CircuitState::Closed);

        // Same instance handed out on repeat lookups.
        assert_eq!(registry.breaker_for("users").state(), CircuitState::Open);
    }
}
