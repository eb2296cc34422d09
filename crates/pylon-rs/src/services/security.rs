//! Security filtering: IP lists, input caps, and threat pattern detection.
//!
//! The filter runs first in the pipeline. It consults the static IP lists
//! plus a dynamic deny set fed by repeated violations, enforces input size
//! and nesting caps, and scans query, headers, and body for injection
//! patterns.

use crate::models::error::GatewayError;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Violations tolerated per IP before it is auto-denied.
const VIOLATION_LIMIT: usize = 10;
/// Window over which violations are counted.
const VIOLATION_WINDOW: Duration = Duration::from_secs(3600);

static DEFAULT_SQL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)union[\s/*]+select",
        r"(?i)insert\s+into",
        r"(?i)drop\s+table",
        r"(?i)delete\s+from",
        r"(?i)\bor\b\s+\d+\s*=\s*\d+",
    ])
});

static DEFAULT_XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[r"(?i)<script", r"(?i)javascript:", r"(?i)\bon\w+\s*="])
});

static DEFAULT_TRAVERSAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[r"\.\./", r"\.\.\\", r"(?i)%2e%2e(%2f|/|\\)", r"(?i)\.\.%2f"])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("invalid built-in security pattern"))
        .collect()
}

/// Security configuration block.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    /// When non-empty this list is authoritative: only these IPs may pass.
    #[serde(default)]
    pub ip_allow_list: Vec<String>,
    #[serde(default)]
    pub ip_deny_list: Vec<String>,
    /// Maximum bytes for one header value (default: 8 KiB).
    #[serde(default = "default_max_header_value")]
    pub max_header_value_bytes: usize,
    /// Maximum bytes for one scalar value in query or body (default: 10 KiB).
    #[serde(default = "default_max_scalar")]
    pub max_scalar_bytes: usize,
    /// Maximum JSON nesting depth for request bodies (default: 10).
    #[serde(default = "default_max_depth")]
    pub max_body_depth: usize,
    /// Extra regexes scanned in addition to the built-in pattern sets.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_max_header_value() -> usize {
    8 * 1024
}

fn default_max_scalar() -> usize {
    10 * 1024
}

fn default_max_depth() -> usize {
    10
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            ip_allow_list: Vec::new(),
            ip_deny_list: Vec::new(),
            max_header_value_bytes: default_max_header_value(),
            max_scalar_bytes: default_max_scalar(),
            max_body_depth: default_max_depth(),
            extra_patterns: Vec::new(),
        }
    }
}

impl SecuritySettings {
    pub fn validate(&self) -> Result<(), String> {
        for pattern in &self.extra_patterns {
            Regex::new(pattern)
                .map_err(|e| format!("Invalid security pattern {}: {}", pattern, e))?;
        }
        if self.max_body_depth == 0 {
            return Err("max_body_depth must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// The security filter with its dynamic deny state.
pub struct SecurityFilter {
    settings: SecuritySettings,
    extra: Vec<Regex>,
    /// IPs denied at runtime after exceeding the violation budget.
    dynamic_deny: RwLock<HashSet<String>>,
    /// Violation timestamps per IP, pruned to the counting window on touch.
    violations: RwLock<HashMap<String, Vec<Instant>>>,
}

impl SecurityFilter {
    pub fn new(settings: SecuritySettings) -> Self {
        let extra = settings
            .extra_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            settings,
            extra,
            dynamic_deny: RwLock::new(HashSet::new()),
            violations: RwLock::new(HashMap::new()),
        }
    }

    /// IP admission: a non-empty allow list is authoritative, otherwise the
    /// static and dynamic deny lists block.
    pub fn check_ip(&self, ip: &str) -> Result<(), GatewayError> {
        if !self.settings.ip_allow_list.is_empty() {
            if self.settings.ip_allow_list.iter().any(|a| a == ip) {
                return Ok(());
            }
            return Err(GatewayError::Forbidden {
                reason: "client address not in allow list".to_string(),
            });
        }

        if self.settings.ip_deny_list.iter().any(|d| d == ip)
            || self.dynamic_deny.read().unwrap().contains(ip)
        {
            return Err(GatewayError::Forbidden {
                reason: "client address is denied".to_string(),
            });
        }
        Ok(())
    }

    /// Validates sizes, nesting, and threat patterns for one request.
    ///
    /// A pattern match counts as a violation against the client IP; past the
    /// budget the IP lands on the dynamic deny list.
    pub fn inspect(
        &self,
        client_ip: &str,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body_json: Option<&serde_json::Value>,
        body_text: Option<&str>,
    ) -> Result<(), GatewayError> {
        for (name, value) in headers {
            if value.len() > self.settings.max_header_value_bytes {
                return Err(GatewayError::Validation {
                    message: format!("header {} exceeds size limit", name),
                });
            }
        }

        for (name, value) in query {
            if value.len() > self.settings.max_scalar_bytes {
                return Err(GatewayError::Validation {
                    message: format!("query parameter {} exceeds size limit", name),
                });
            }
        }

        if let Some(json) = body_json {
            if json_depth(json) > self.settings.max_body_depth {
                return Err(GatewayError::Validation {
                    message: "request body nesting exceeds limit".to_string(),
                });
            }
            let mut oversized = false;
            walk_strings(json, &mut |s| {
                if s.len() > self.settings.max_scalar_bytes {
                    oversized = true;
                }
            });
            if oversized {
                return Err(GatewayError::Validation {
                    message: "request body value exceeds size limit".to_string(),
                });
            }
        }

        if let Some(category) = self.scan(query, headers, body_json, body_text) {
            self.record_violation(client_ip);
            return Err(GatewayError::Validation {
                message: format!("request blocked by {} filter", category),
            });
        }

        Ok(())
    }

    fn scan(
        &self,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body_json: Option<&serde_json::Value>,
        body_text: Option<&str>,
    ) -> Option<&'static str> {
        let mut matched = None;

        let mut check = |value: &str| {
            if matched.is_some() {
                return;
            }
            matched = self.match_category(value);
        };

        for (name, value) in query {
            check(name);
            check(value);
        }
        for value in headers.values() {
            check(value);
        }
        if let Some(json) = body_json {
            walk_strings(json, &mut |s| check(s));
        } else if let Some(text) = body_text {
            check(text);
        }

        matched
    }

    fn match_category(&self, value: &str) -> Option<&'static str> {
        if DEFAULT_SQL_PATTERNS.iter().any(|r| r.is_match(value)) {
            return Some("sql-injection");
        }
        if DEFAULT_XSS_PATTERNS.iter().any(|r| r.is_match(value)) {
            return Some("xss");
        }
        if DEFAULT_TRAVERSAL_PATTERNS.iter().any(|r| r.is_match(value)) {
            return Some("path-traversal");
        }
        if self.extra.iter().any(|r| r.is_match(value)) {
            return Some("custom-pattern");
        }
        None
    }

    fn record_violation(&self, ip: &str) {
        let now = Instant::now();
        let mut violations = self.violations.write().unwrap();
        let entries = violations.entry(ip.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < VIOLATION_WINDOW);
        entries.push(now);
        debug!("Security violation {} of {} for {}", entries.len(), VIOLATION_LIMIT, ip);

        if entries.len() > VIOLATION_LIMIT {
            warn!("Denying {} after {} violations within the window", ip, entries.len());
            self.dynamic_deny.write().unwrap().insert(ip.to_string());
        }
    }

    #[cfg(test)]
    fn is_dynamically_denied(&self, ip: &str) -> bool {
        self.dynamic_deny.read().unwrap().contains(ip)
    }
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        _ => 0,
    }
}

fn walk_strings<F: FnMut(&str)>(value: &serde_json::Value, f: &mut F) {
    match value {
        serde_json::Value::String(s) => f(s),
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                f(key);
                walk_strings(v, f);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                walk_strings(v, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> SecurityFilter {
        SecurityFilter::new(SecuritySettings::default())
    }

    fn empty() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_allow_list_is_authoritative() {
        let filter = SecurityFilter::new(SecuritySettings {
            ip_allow_list: vec!["10.0.0.1".into()],
            ip_deny_list: vec!["10.0.0.1".into()],
            ..SecuritySettings::default()
        });
        // Allow list wins even though the same IP is denied.
        assert!(filter.check_ip("10.0.0.1").is_ok());
        assert!(filter.check_ip("10.0.0.2").is_err());
    }

    #[test]
    fn test_deny_list_blocks() {
        let filter = SecurityFilter::new(SecuritySettings {
            ip_deny_list: vec!["6.6.6.6".into()],
            ..SecuritySettings::default()
        });
        assert!(filter.check_ip("6.6.6.6").is_err());
        assert!(filter.check_ip("1.1.1.1").is_ok());
    }

    #[test]
    fn test_sql_injection_detected() {
        let filter = filter();
        let mut query = empty();
        query.insert("q".into(), "1 UNION SELECT password FROM users".into());
        let err = filter
            .inspect("1.2.3.4", &query, &empty(), None, None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_xss_detected_in_body() {
        let filter = filter();
        let body = json!({"comment": "<script>alert(1)</script>"});
        assert!(filter
            .inspect("1.2.3.4", &empty(), &empty(), Some(&body), None)
            .is_err());
    }

    #[test]
    fn test_traversal_detected_encoded() {
        let filter = filter();
        let mut query = empty();
        query.insert("file".into(), "%2e%2e%2fetc/passwd".into());
        assert!(filter
            .inspect("1.2.3.4", &query, &empty(), None, None)
            .is_err());
    }

    #[test]
    fn test_clean_request_passes() {
        let filter = filter();
        let mut query = empty();
        query.insert("page".into(), "2".into());
        let body = json!({"name": "alice", "tags": ["a", "b"]});
        assert!(filter
            .inspect("1.2.3.4", &query, &empty(), Some(&body), None)
            .is_ok());
    }

    #[test]
    fn test_header_size_cap() {
        let filter = filter();
        let mut headers = empty();
        headers.insert("x-big".into(), "v".repeat(9 * 1024));
        let err = filter
            .inspect("1.2.3.4", &empty(), &headers, None, None)
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_body_depth_cap() {
        let filter = filter();
        let mut body = json!("leaf");
        for _ in 0..12 {
            body = json!({ "nested": body });
        }
        assert!(filter
            .inspect("1.2.3.4", &empty(), &empty(), Some(&body), None)
            .is_err());
    }

    #[test]
    fn test_repeated_violations_deny_ip() {
        let filter = filter();
        let mut query = empty();
        query.insert("q".into(), "<script>x</script>".into());

        for _ in 0..=VIOLATION_LIMIT {
            let _ = filter.inspect("7.7.7.7", &query, &empty(), None, None);
        }
        assert!(filter.is_dynamically_denied("7.7.7.7"));
        assert!(filter.check_ip("7.7.7.7").is_err());
    }

    #[test]
    fn test_json_depth() {
        assert_eq!(json_depth(&json!("x")), 0);
        assert_eq!(json_depth(&json!({"a": 1})), 1);
        assert_eq!(json_depth(&json!({"a": {"b": [1]}})), 3);
    }
}
