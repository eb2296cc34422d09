//! Two-tier response cache with path-driven TTLs and keyed invalidation.
//!
//! The primary tier is an external Redis store reached through a multiplexed
//! connection manager. Whenever Redis is unreachable the cache degrades to an
//! in-process map with its own TTL index; the two tiers are not synchronized
//! with each other. A background sweeper evicts expired in-process entries
//! every 60 seconds and probes Redis to re-engage the primary tier.
//!
//! Two in-flight misses on the same key may both fetch upstream and both
//! write. The cacheability rules make those writes identical, so
//! last-write-wins needs no stampede lock.

use actix_web::web::Bytes;
use base64::Engine;
use log::{debug, info, warn};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Headers preserved in cache entries and replayed on a hit.
const PRESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "etag",
    "last-modified",
    "cache-control",
];

/// Request headers that participate in the cache key.
const VARY_HEADERS: &[&str] = &["accept", "accept-language", "accept-encoding"];

/// Per-path TTL strategy entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PathTtlRule {
    pub prefix: String,
    pub ttl_secs: u64,
}

/// Methods whose success invalidates cached entries under a prefix.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationRule {
    pub prefix: String,
    #[serde(default = "default_invalidation_methods")]
    pub methods: Vec<String>,
}

fn default_invalidation_methods() -> Vec<String> {
    vec!["POST".into(), "PUT".into(), "PATCH".into(), "DELETE".into()]
}

/// Cache configuration block.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Redis connection URL; absent means in-process only.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cacheable_methods")]
    pub cacheable_methods: Vec<String>,
    #[serde(default = "default_cacheable_statuses")]
    pub cacheable_statuses: Vec<u16>,
    /// Request headers that disqualify a request from caching.
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
    #[serde(default)]
    pub path_ttls: Vec<PathTtlRule>,
    #[serde(default)]
    pub invalidation: Vec<InvalidationRule>,
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "pylon:cache:".to_string()
}

fn default_ttl() -> u64 {
    300
}

fn default_cacheable_methods() -> Vec<String> {
    vec!["GET".into(), "HEAD".into()]
}

fn default_cacheable_statuses() -> Vec<u16> {
    vec![200, 201, 202, 203, 204, 206, 301, 302, 304]
}

fn default_sensitive_headers() -> Vec<String> {
    vec!["authorization".into(), "cookie".into(), "x-api-key".into()]
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            key_prefix: default_key_prefix(),
            default_ttl_secs: default_ttl(),
            cacheable_methods: default_cacheable_methods(),
            cacheable_statuses: default_cacheable_statuses(),
            sensitive_headers: default_sensitive_headers(),
            path_ttls: Vec::new(),
            invalidation: Vec::new(),
        }
    }
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_secs == 0 {
            return Err("Cache default TTL must be greater than 0".to_string());
        }
        if self.key_prefix.is_empty() {
            return Err("Cache key prefix cannot be empty".to_string());
        }
        for rule in &self.path_ttls {
            if !rule.prefix.starts_with('/') {
                return Err(format!("Cache TTL prefix must start with '/': {}", rule.prefix));
            }
        }
        for rule in &self.invalidation {
            if !rule.prefix.starts_with('/') {
                return Err(format!(
                    "Cache invalidation prefix must start with '/': {}",
                    rule.prefix
                ));
            }
        }
        Ok(())
    }
}

/// A cached response representation.
///
/// The body is base64-encoded for transport through the external store; the
/// TTL is a property of the store entry, not of this value.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body_b64: String,
    pub stored_at: String,
}

impl CacheEntry {
    /// Builds an entry from an outbound response, keeping only the
    /// preserved header set.
    pub fn from_response(status: u16, headers: &[(String, String)], body: &[u8]) -> Self {
        let preserved = headers
            .iter()
            .filter(|(name, _)| PRESERVED_HEADERS.contains(&name.as_str()))
            .cloned()
            .collect();
        Self {
            status,
            headers: preserved,
            body_b64: base64::engine::general_purpose::STANDARD.encode(body),
            stored_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn body(&self) -> Bytes {
        base64::engine::general_purpose::STANDARD
            .decode(&self.body_b64)
            .map(Bytes::from)
            .unwrap_or_default()
    }
}

struct LocalEntry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// The two-tier response cache.
pub struct ResponseCache {
    settings: CacheSettings,
    redis: Option<redis::aio::ConnectionManager>,
    /// Flips to false on the first failed Redis operation and back to true
    /// when a sweeper-tick ping succeeds.
    redis_available: Arc<AtomicBool>,
    local: Arc<RwLock<HashMap<String, LocalEntry>>>,
}

impl ResponseCache {
    /// Connects to the configured Redis store. A connection failure is not
    /// fatal: the cache starts on the in-process tier and the sweeper keeps
    /// probing the primary.
    pub async fn connect(settings: CacheSettings) -> Self {
        let redis = match settings.redis_url.as_deref() {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                    Ok(manager) => {
                        info!("Connected to cache store at {}", url);
                        Some(manager)
                    }
                    Err(e) => {
                        warn!("Cache store unreachable, using in-process tier: {}", e);
                        None
                    }
                },
                Err(e) => {
                    warn!("Invalid cache store URL {}: {}", url, e);
                    None
                }
            },
            None => None,
        };

        let available = redis.is_some();
        Self {
            settings,
            redis,
            redis_available: Arc::new(AtomicBool::new(available)),
            local: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// In-process-only cache, used when no store is configured and in tests.
    pub fn in_process(settings: CacheSettings) -> Self {
        Self {
            settings,
            redis: None,
            redis_available: Arc::new(AtomicBool::new(false)),
            local: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    fn primary_engaged(&self) -> bool {
        self.redis.is_some() && self.redis_available.load(Ordering::Relaxed)
    }

    fn mark_unavailable(&self, context: &str, error: &redis::RedisError) {
        if self.redis_available.swap(false, Ordering::Relaxed) {
            warn!("Cache store error during {}, falling back to in-process tier: {}", context, error);
        }
    }

    /// Computes the cache key for a request.
    ///
    /// The key embeds the method and path in clear (so prefix invalidation
    /// can match against stored keys) followed by a digest over the method,
    /// path, sorted query string, and the small fixed set of accept headers.
    /// Sorting the query makes `?a=1&b=2` and `?b=2&a=1` share an entry.
    pub fn cache_key(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> String {
        let mut pairs: Vec<(&String, &String)> = query.iter().collect();
        pairs.sort();
        let sorted_query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let vary = VARY_HEADERS
            .iter()
            .filter_map(|name| headers.get(*name).map(|v| format!("{}:{}", name, v)))
            .collect::<Vec<_>>()
            .join(",");

        let mut hasher = Sha256::new();
        hasher.update(method.as_bytes());
        hasher.update(b":");
        hasher.update(path.as_bytes());
        hasher.update(b"?");
        hasher.update(sorted_query.as_bytes());
        hasher.update(b"|");
        hasher.update(vary.as_bytes());
        let digest = hasher.finalize();

        format!(
            "{}{}:{}:{:x}",
            self.settings.key_prefix, method, path, digest
        )
    }

    /// Whether the request side allows caching at all.
    pub fn is_request_cacheable(&self, method: &str, headers: &HashMap<String, String>) -> bool {
        if !self.settings.enabled {
            return false;
        }
        if !self
            .settings
            .cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
        {
            return false;
        }
        !self
            .settings
            .sensitive_headers
            .iter()
            .any(|name| headers.contains_key(&name.to_ascii_lowercase()))
    }

    /// Whether the response side allows storing this exchange.
    pub fn is_response_cacheable(
        &self,
        status: u16,
        response_headers: &[(String, String)],
        body: &[u8],
    ) -> bool {
        if !self.settings.cacheable_statuses.contains(&status) {
            return false;
        }
        // A 304 carries no body of its own; cache it only when a complete
        // representation is present.
        if status == 304 && body.is_empty() {
            return false;
        }
        if let Some(cache_control) = header_value(response_headers, "cache-control") {
            let lowered = cache_control.to_ascii_lowercase();
            if lowered.contains("no-cache")
                || lowered.contains("no-store")
                || lowered.contains("private")
            {
                return false;
            }
        }
        true
    }

    /// TTL for a response: explicit `max-age` wins, then the per-path
    /// strategy (longest matching prefix), then the default.
    pub fn ttl_for(&self, path: &str, response_headers: &[(String, String)]) -> u64 {
        if let Some(cache_control) = header_value(response_headers, "cache-control") {
            if let Some(max_age) = parse_max_age(cache_control) {
                return max_age;
            }
        }
        self.settings
            .path_ttls
            .iter()
            .filter(|rule| path.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .map(|rule| rule.ttl_secs)
            .unwrap_or(self.settings.default_ttl_secs)
    }

    /// The invalidation prefix triggered by this request, if any.
    pub fn invalidation_prefix(&self, method: &str, path: &str) -> Option<&str> {
        self.settings
            .invalidation
            .iter()
            .find(|rule| {
                path.starts_with(&rule.prefix)
                    && rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            })
            .map(|rule| rule.prefix.as_str())
    }

    /// Reads an entry from the active tier.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        if self.primary_engaged() {
            let mut conn = self.redis.clone().unwrap();
            match conn.get::<_, Option<String>>(key).await {
                Ok(Some(raw)) => return serde_json::from_str(&raw).ok(),
                Ok(None) => return None,
                Err(e) => self.mark_unavailable("get", &e),
            }
        }

        let local = self.local.read().unwrap();
        local.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.entry.clone())
            } else {
                None
            }
        })
    }

    /// Writes an entry into the active tier with the given TTL.
    pub async fn set(&self, key: &str, entry: CacheEntry, ttl_secs: u64) {
        if self.primary_engaged() {
            let raw = match serde_json::to_string(&entry) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Failed to serialize cache entry: {}", e);
                    return;
                }
            };
            let mut conn = self.redis.clone().unwrap();
            match conn.set_ex::<_, _, ()>(key, raw, ttl_secs).await {
                Ok(()) => return,
                Err(e) => self.mark_unavailable("set", &e),
            }
        }

        let mut local = self.local.write().unwrap();
        local.insert(
            key.to_string(),
            LocalEntry {
                entry,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
    }

    /// Removes every entry whose path component starts with `prefix`.
    /// Best-effort: store errors only degrade the tier.
    pub async fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0;

        if self.primary_engaged() {
            let pattern = format!("{}*:{}*", self.settings.key_prefix, prefix);
            match self.redis_delete_pattern(&pattern).await {
                Ok(count) => {
                    debug!("Invalidated {} cache entries under {}", count, prefix);
                    return count;
                }
                Err(e) => self.mark_unavailable("invalidate", &e),
            }
        }

        let mut local = self.local.write().unwrap();
        local.retain(|key, _| {
            let keep = !key_matches_prefix(key, &self.settings.key_prefix, prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        debug!("Invalidated {} cache entries under {}", removed, prefix);
        removed
    }

    /// Drops every entry in the active tier.
    pub async fn flush(&self) -> u64 {
        if self.primary_engaged() {
            let pattern = format!("{}*", self.settings.key_prefix);
            match self.redis_delete_pattern(&pattern).await {
                Ok(count) => return count,
                Err(e) => self.mark_unavailable("flush", &e),
            }
        }

        let mut local = self.local.write().unwrap();
        let count = local.len() as u64;
        local.clear();
        count
    }

    async fn redis_delete_pattern(&self, pattern: &str) -> redis::RedisResult<u64> {
        let mut scan_conn = self.redis.clone().unwrap();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = scan_conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let mut del_conn = self.redis.clone().unwrap();
        let count = keys.len() as u64;
        del_conn.del::<_, ()>(keys).await?;
        Ok(count)
    }

    /// Spawns the 60 s sweeper: evicts expired in-process entries and pings
    /// Redis to re-engage the primary tier after an outage.
    pub fn spawn_sweeper(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let local = self.local.clone();
        let redis = self.redis.clone();
        let available = self.redis_available.clone();
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let evicted = {
                            let mut local = local.write().unwrap();
                            let before = local.len();
                            local.retain(|_, e| e.expires_at > now);
                            before - local.len()
                        };
                        if evicted > 0 {
                            debug!("Cache sweeper evicted {} expired entries", evicted);
                        }

                        if let Some(manager) = &redis {
                            if !available.load(Ordering::Relaxed) {
                                let mut conn = manager.clone();
                                let pong: redis::RedisResult<String> =
                                    redis::cmd("PING").query_async(&mut conn).await;
                                if pong.is_ok() {
                                    info!("Cache store reachable again, primary tier re-engaged");
                                    available.store(true, Ordering::Relaxed);
                                }
                            }
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

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|v| v.parse().ok())
}

/// Key layout is `{key_prefix}{METHOD}:{path}:{digest}`; a key matches a
/// path prefix when its path component starts with it.
fn key_matches_prefix(key: &str, key_prefix: &str, path_prefix: &str) -> bool {
    key.strip_prefix(key_prefix)
        .and_then(|rest| rest.split_once(':'))
        .map(|(_, path_and_digest)| path_and_digest.starts_with(path_prefix))
        .unwrap_or(false)
}
