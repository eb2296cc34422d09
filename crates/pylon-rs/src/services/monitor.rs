//! Monitoring counters, bounded sample rings, and the alert log.
//!
//! All collections are bounded and evict oldest-first, so the monitor's
//! memory use is constant regardless of uptime.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Monitoring configuration block.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Recent response times kept (default: 1000).
    #[serde(default = "default_response_time_capacity")]
    pub response_time_capacity: usize,
    /// CPU and memory samples kept (default: 100).
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
    /// Alert entries kept (default: 100).
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
    /// Error-rate percentage that raises an alert (default: 25).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: u8,
    /// Average response time in ms that raises an alert (default: 5000).
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_response_time_capacity() -> usize {
    1000
}

fn default_sample_capacity() -> usize {
    100
}

fn default_alert_capacity() -> usize {
    100
}

fn default_error_rate_threshold() -> u8 {
    25
}

fn default_slow_response_ms() -> u64 {
    5000
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            response_time_capacity: default_response_time_capacity(),
            sample_capacity: default_sample_capacity(),
            alert_capacity: default_alert_capacity(),
            error_rate_threshold: default_error_rate_threshold(),
            slow_response_ms: default_slow_response_ms(),
        }
    }
}

/// One alert entry.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring buffer that evicts oldest on write.
#[derive(Debug)]
struct Ring<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

/// Gateway-wide metrics collector.
pub struct GatewayMonitor {
    settings: MonitoringSettings,
    requests_total: AtomicU64,
    requests_error: AtomicU64,
    active_connections: AtomicU64,
    by_method: RwLock<HashMap<String, u64>>,
    by_path: RwLock<HashMap<String, u64>>,
    by_status: RwLock<HashMap<u16, u64>>,
    response_times_ms: RwLock<Ring<u64>>,
    cpu_samples: RwLock<Ring<f64>>,
    memory_samples: RwLock<Ring<u64>>,
    alerts: RwLock<Ring<Alert>>,
    started: Instant,
}

impl GatewayMonitor {
    pub fn new(settings: MonitoringSettings) -> Self {
        let response_capacity = settings.response_time_capacity;
        let sample_capacity = settings.sample_capacity;
        let alert_capacity = settings.alert_capacity;
        Self {
            settings,
            requests_total: AtomicU64::new(0),
            requests_error: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            by_method: RwLock::new(HashMap::new()),
            by_path: RwLock::new(HashMap::new()),
            by_status: RwLock::new(HashMap::new()),
            response_times_ms: RwLock::new(Ring::new(response_capacity)),
            cpu_samples: RwLock::new(Ring::new(sample_capacity)),
            memory_samples: RwLock::new(Ring::new(sample_capacity)),
            alerts: RwLock::new(Ring::new(alert_capacity)),
            started: Instant::now(),
        }
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Records one completed request.
    pub fn record_request(&self, method: &str, path: &str, status: u16, elapsed: Duration) {
        if !self.settings.enabled {
            return;
        }
        let total = self.requests_total.fetch_add(1, Ordering::Relaxed) + 1;
        if status >= 500 {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
        }

        *self.by_method.write().unwrap().entry(method.to_string()).or_insert(0) += 1;
        *self.by_path.write().unwrap().entry(path.to_string()).or_insert(0) += 1;
        *self.by_status.write().unwrap().entry(status).or_insert(0) += 1;
        self.response_times_ms
            .write()
            .unwrap()
            .push(elapsed.as_millis() as u64);

        // Threshold evaluation is sampled so the hot path stays cheap.
        if total % 100 == 0 {
            self.evaluate_alerts(total);
        }
    }

    fn evaluate_alerts(&self, total: u64) {
        let errors = self.requests_error.load(Ordering::Relaxed);
        let error_rate = errors as f64 / total as f64 * 100.0;
        if error_rate >= self.settings.error_rate_threshold as f64 {
            self.raise_alert(
                "error_rate",
                format!("error rate at {:.1}% over {} requests", error_rate, total),
            );
        }

        let avg = self.average_response_time_ms();
        if avg > self.settings.slow_response_ms as f64 {
            self.raise_alert(
                "slow_responses",
                format!("average response time {:.0}ms", avg),
            );
        }
    }

    pub fn raise_alert(&self, kind: &str, message: String) {
        warn!("Alert [{}]: {}", kind, message);
        self.alerts.write().unwrap().push(Alert {
            kind: kind.to_string(),
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn record_system_sample(&self, cpu_load: f64, memory_bytes: u64) {
        self.cpu_samples.write().unwrap().push(cpu_load);
        self.memory_samples.write().unwrap().push(memory_bytes);
    }

    pub fn average_response_time_ms(&self) -> f64 {
        let times = self.response_times_ms.read().unwrap();
        if times.items.is_empty() {
            return 0.0;
        }
        times.items.iter().sum::<u64>() as f64 / times.items.len() as f64
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Full snapshot served by `/metrics`.
    pub fn snapshot(&self) -> serde_json::Value {
        let total = self.requests_total.load(Ordering::Relaxed);
        let errors = self.requests_error.load(Ordering::Relaxed);
        let error_rate = if total > 0 {
            errors as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let by_status: HashMap<String, u64> = self
            .by_status
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        json!({
            "uptime": self.uptime_secs(),
            "requests": {
                "total": total,
                "errors": errors,
                "errorRate": error_rate,
                "active": self.active_connections.load(Ordering::Relaxed),
                "byMethod": self.by_method.read().unwrap().clone(),
                "byPath": self.by_path.read().unwrap().clone(),
                "byStatus": by_status,
            },
            "responseTime": {
                "averageMs": self.average_response_time_ms(),
                "samples": self.response_times_ms.read().unwrap().items.len(),
            },
            "system": {
                "cpu": self.cpu_samples.read().unwrap().items.iter().cloned().collect::<Vec<_>>(),
                "memory": self.memory_samples.read().unwrap().items.iter().cloned().collect::<Vec<_>>(),
            },
            "alerts": self.alerts.read().unwrap().items.iter().cloned().collect::<Vec<_>>(),
        })
    }

    /// Spawns a sampler that records load average and resident memory every
    /// 30 seconds. Reads /proc, so it quietly records nothing elsewhere.
    pub fn spawn_sampler(
        self: std::sync::Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self;
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some((cpu, memory)) = read_proc_sample() {
                            monitor.record_system_sample(cpu, memory);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn read_proc_sample() -> Option<(f64, u64)> {
    let load = std::fs::read_to_string("/proc/loadavg").ok()?;
    let cpu: f64 = load.split_whitespace().next()?.parse().ok()?;

    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some((cpu, resident_pages * 4096))
}
