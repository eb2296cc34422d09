//! Fixed-window rate limiting and quota accounting.
//!
//! Two limits are checked in order: a global window keyed by client IP, then
//! a per-identity quota keyed by principal or API key. Windows are fixed
//! rather than sliding: `window_start = floor(now / window) * window`, reset
//! lazily on the next touch. That bounds memory to one bucket per key and
//! avoids per-request cleanup, at the cost of a 2x burst at window
//! boundaries.

use crate::models::context::QuotaState;
use crate::models::principal::Principal;
use ahash::RandomState;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// One fixed-window limit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct WindowLimit {
    pub window_ms: u64,
    pub max_requests: u64,
}

/// Latency injection applied beyond a request count, instead of rejection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct SlowDownPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Requests in the window before delays start.
    #[serde(default = "default_slow_down_after")]
    pub after_requests: u64,
    /// Delay added per request beyond the threshold, in milliseconds.
    #[serde(default = "default_slow_down_delay")]
    pub delay_ms: u64,
    /// Upper bound on the injected delay.
    #[serde(default = "default_slow_down_max")]
    pub max_delay_ms: u64,
}

fn default_slow_down_after() -> u64 {
    50
}

fn default_slow_down_delay() -> u64 {
    500
}

fn default_slow_down_max() -> u64 {
    10_000
}

impl Default for SlowDownPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            after_requests: default_slow_down_after(),
            delay_ms: default_slow_down_delay(),
            max_delay_ms: default_slow_down_max(),
        }
    }
}

/// Rate limiter configuration block.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSettings {
    /// Global window keyed by client IP (default: 1000 requests / 15 min).
    #[serde(default = "default_global_limit")]
    pub global: WindowLimit,
    /// Per-identity quota (default: 100 requests / min); API key records may
    /// override it per key.
    #[serde(default = "default_identity_limit")]
    pub identity: WindowLimit,
    #[serde(default)]
    pub slow_down: SlowDownPolicy,
}

fn default_global_limit() -> WindowLimit {
    WindowLimit {
        window_ms: 15 * 60 * 1000,
        max_requests: 1000,
    }
}

fn default_identity_limit() -> WindowLimit {
    WindowLimit {
        window_ms: 60 * 1000,
        max_requests: 100,
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            identity: default_identity_limit(),
            slow_down: SlowDownPolicy::default(),
        }
    }
}

impl RateLimitSettings {
    pub fn validate(&self) -> Result<(), String> {
        for (name, limit) in [("global", &self.global), ("identity", &self.identity)] {
            if limit.window_ms == 0 {
                return Err(format!("Rate limit {} window must be greater than 0", name));
            }
            if limit.max_requests == 0 {
                return Err(format!("Rate limit {} max requests must be greater than 0", name));
            }
        }
        Ok(())
    }
}

/// Fixed-window counter for one key.
#[derive(Debug, Clone, Copy)]
struct QuotaBucket {
    window_start_ms: u64,
    count: u64,
}

/// Outcome of one limit check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub state: QuotaState,
    /// Human-readable reason, set on denial.
    pub reason: Option<String>,
}

/// Quota accountant for both the global IP window and per-identity buckets.
///
/// The read-modify-write of each bucket happens under the map's write lock,
/// which keeps window rollover and counting atomic per key.
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: Arc<RwLock<HashMap<String, QuotaBucket, RandomState>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: Arc::new(RwLock::new(HashMap::default())),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Core fixed-window check. The bucket is reinitialized whenever `now`
    /// has moved past the bucket's window, then the request is counted only
    /// if it is admitted.
    fn check(&self, key: &str, limit: WindowLimit, now_ms: u64) -> RateDecision {
        let window_start = now_ms / limit.window_ms * limit.window_ms;
        let mut buckets = self.buckets.write().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(QuotaBucket {
            window_start_ms: window_start,
            count: 0,
        });

        if bucket.window_start_ms != window_start {
            bucket.window_start_ms = window_start;
            bucket.count = 0;
        }

        let allowed = bucket.count < limit.max_requests;
        if allowed {
            bucket.count += 1;
        }

        let reset_ms = bucket.window_start_ms + limit.window_ms - now_ms;
        let state = QuotaState {
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(bucket.count),
            reset_secs: (reset_ms as f64 / 1000.0).ceil() as u64,
        };

        RateDecision {
            allowed,
            state,
            reason: (!allowed).then(|| format!("limit of {} requests exhausted", limit.max_requests)),
        }
    }

    /// Checks the global per-IP window.
    pub fn check_global(&self, client_ip: &str) -> RateDecision {
        let decision = self.check(
            &format!("ip:{}", client_ip),
            self.settings.global,
            Self::now_ms(),
        );
        if !decision.allowed {
            warn!("Global rate limit exceeded for {}", client_ip);
        }
        decision
    }

    /// Checks the per-identity quota. An API key carrying its own quota
    /// overrides the configured default.
    pub fn check_identity(&self, principal: &Principal) -> RateDecision {
        let limit = principal
            .api_key
            .as_ref()
            .and_then(|record| record.quota.as_ref())
            .map(|quota| WindowLimit {
                window_ms: quota.window_ms,
                max_requests: quota.max_requests,
            })
            .unwrap_or(self.settings.identity);

        let decision = self.check(&principal.quota_key(), limit, Self::now_ms());
        if !decision.allowed {
            warn!("Quota exhausted for {}", principal.quota_key());
        }
        decision
    }

    /// Computes the slow-down delay for this IP's current window, if the
    /// policy is enabled and the threshold has been passed. This is latency
    /// injection, not rejection.
    pub fn slow_down_delay(&self, client_ip: &str) -> Option<Duration> {
        let policy = self.settings.slow_down;
        if !policy.enabled {
            return None;
        }

        let key = format!("ip:{}", client_ip);
        let limit = self.settings.global;
        let now_ms = Self::now_ms();
        let window_start = now_ms / limit.window_ms * limit.window_ms;

        let buckets = self.buckets.read().unwrap();
        let bucket = buckets.get(&key)?;
        if bucket.window_start_ms != window_start || bucket.count <= policy.after_requests {
            return None;
        }

        let over = bucket.count - policy.after_requests;
        let delay_ms = (over * policy.delay_ms).min(policy.max_delay_ms);
        debug!("Slowing down {} by {}ms ({} over threshold)", client_ip, delay_ms, over);
        Some(Duration::from_millis(delay_ms))
    }

    /// Spawns the background sweeper that drops buckets whose window ended
    /// more than one full window ago.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let buckets = self.buckets.clone();
        let max_window = self
            .settings
            .global
            .window_ms
            .max(self.settings.identity.window_ms);
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Self::now_ms();
                        let mut buckets = buckets.write().unwrap();
                        let before = buckets.len();
                        buckets.retain(|_, b| now.saturating_sub(b.window_start_ms) < max_window * 2);
                        if buckets.len() != before {
                            info!("Quota sweeper evicted {} stale buckets", before - buckets.len());
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

    #[cfg(test)]
    fn check_at(&self, key: &str, limit: WindowLimit, now_ms: u64) -> RateDecision {
        self.check(key, limit, now_ms)
    }
}
