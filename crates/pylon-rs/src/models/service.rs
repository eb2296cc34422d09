//! Backend service descriptors for request routing.

use serde::{Deserialize, Serialize};

/// Load balancing strategy for distributing requests across instances.
///
/// # Strategies
///
/// - **RoundRobin**: advances a per-service index in circular order
/// - **WeightedRoundRobin**: round-robin over a weight-expanded list
/// - **LeastConnections**: picks the instance with fewest live connections
/// - **Random**: uniform random selection
/// - **IpHash**: deterministic per client IP (sticky sessions)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    IpHash,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// One addressable backend endpoint of a service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Target host including protocol, e.g. `http://users-1.internal`.
    pub host: String,
    pub port: u16,
    /// Weight for weighted round-robin (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServiceInstance {
    /// Stable identifier used in health tables, connection counters, and the
    /// `X-Gateway-Instance` header.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for upstream requests.
    pub fn url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.host.starts_with("http://") && !self.host.starts_with("https://") {
            return Err(format!(
                "Instance host must start with http:// or https://: {}",
                self.host
            ));
        }
        if self.port == 0 {
            return Err("Instance port must be between 1 and 65535".to_string());
        }
        if self.weight == 0 {
            return Err("Instance weight must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Health probe configuration for a service's instances.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Path probed with GET on each instance (default: `/health`).
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Seconds between probe rounds (default: 30).
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Per-probe timeout in seconds (default: 5).
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
        }
    }
}

/// Circuit breaker parameters, configurable globally and per service.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Per-upstream-call timeout in milliseconds (default: 30000).
    #[serde(default = "default_cb_timeout_ms")]
    pub timeout_ms: u64,
    /// Minimum failures before the circuit may open (default: 5).
    #[serde(default = "default_cb_error_count")]
    pub error_count: u64,
    /// Failure percentage at or above which the circuit opens (default: 50).
    #[serde(default = "default_cb_error_threshold")]
    pub error_threshold: u8,
    /// Milliseconds an open circuit waits before probing (default: 30000).
    #[serde(default = "default_cb_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes required to close; also the
    /// concurrent half-open probe budget (default: 3, must be > 0).
    #[serde(default = "default_cb_half_open_requests")]
    pub half_open_requests: u64,
}

fn default_cb_timeout_ms() -> u64 {
    30_000
}

fn default_cb_error_count() -> u64 {
    5
}

fn default_cb_error_threshold() -> u8 {
    50
}

fn default_cb_reset_timeout_ms() -> u64 {
    30_000
}

fn default_cb_half_open_requests() -> u64 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_cb_timeout_ms(),
            error_count: default_cb_error_count(),
            error_threshold: default_cb_error_threshold(),
            reset_timeout_ms: default_cb_reset_timeout_ms(),
            half_open_requests: default_cb_half_open_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.half_open_requests == 0 {
            // A zero probe budget means the breaker could never close again.
            return Err("half_open_requests must be greater than 0".to_string());
        }
        if self.error_threshold > 100 {
            return Err("error_threshold is a percentage and cannot exceed 100".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Configuration for one proxied backend service.
///
/// # Examples
///
/// ```json
/// {
///   "name": "users",
///   "pathPrefix": "/api/users",
///   "stripPrefix": true,
///   "instances": [
///     {"host": "http://users-1.internal", "port": 8080, "weight": 2},
///     {"host": "http://users-2.internal", "port": 8080, "weight": 1}
///   ],
///   "loadBalancing": "weighted_round_robin",
///   "timeoutSecs": 30
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Service name; also the circuit breaker key for `/api/<name>/…` paths.
    pub name: String,
    /// External path prefix owned by this service.
    pub path_prefix: String,
    /// Whether the prefix is removed before forwarding upstream.
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,
    pub instances: Vec<ServiceInstance>,
    #[serde(default)]
    pub load_balancing: LoadBalancingStrategy,
    /// Upstream request timeout in seconds (default: 30).
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Per-service circuit breaker overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_strip_prefix() -> bool {
    true
}

fn default_service_timeout() -> u64 {
    30
}

impl ServiceDescriptor {
    /// Validates the descriptor for correctness before the gateway starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Service name cannot be empty".to_string());
        }
        if !self.path_prefix.starts_with('/') {
            return Err(format!(
                "Service {} path prefix must start with '/'",
                self.name
            ));
        }
        if self.instances.is_empty() {
            return Err(format!(
                "Service {} must declare at least one instance",
                self.name
            ));
        }
        for (i, instance) in self.instances.iter().enumerate() {
            instance
                .validate()
                .map_err(|e| format!("Service {} instance {}: {}", self.name, i, e))?;
        }
        if self.timeout_secs == 0 {
            return Err(format!("Service {} timeout must be greater than 0", self.name));
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()
                .map_err(|e| format!("Service {} circuit breaker: {}", self.name, e))?;
        }
        Ok(())
    }

    /// Whether this service owns the given request path.
    pub fn matches(&self, path: &str) -> bool {
        path == self.path_prefix
            || path.starts_with(&self.path_prefix)
                && path.as_bytes().get(self.path_prefix.len()) == Some(&b'/')
    }

    /// Rewrites the external path for upstream forwarding, honoring
    /// `strip_prefix`.
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        let rest = path.strip_prefix(&self.path_prefix).unwrap_or(path);
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    }
}
