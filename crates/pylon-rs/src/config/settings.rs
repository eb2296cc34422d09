//! Configuration loading and merging.
//!
//! Settings are assembled from three layers, weakest first:
//!
//! 1. compiled defaults,
//! 2. an optional JSON file (`PYLON_CONFIG_PATH`, default `./config.json`),
//! 3. environment variable overrides.
//!
//! Layers deep-merge: overlapping objects combine recursively, scalars and
//! arrays are replaced wholesale.

use crate::models::settings::Settings;
use log::{debug, info};
use serde_json::Value;
use std::path::Path;

/// Loads settings from the default location with env overrides applied.
pub fn load_settings() -> Result<Settings, String> {
    let path = std::env::var("PYLON_CONFIG_PATH").unwrap_or_else(|_| "./config.json".to_string());
    load_settings_from(&path)
}

/// Loads settings from an explicit file path. A missing file is not an
/// error: defaults plus environment overrides apply.
pub fn load_settings_from(path: &str) -> Result<Settings, String> {
    let mut merged = serde_json::to_value(Settings::default())
        .map_err(|e| format!("Failed to serialize default settings: {}", e))?;

    if Path::new(path).exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;
        let file_value: Value = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid JSON in config file {}: {}", path, e))?;
        deep_merge(&mut merged, file_value);
        info!("Loaded configuration from {}", path);
    } else {
        debug!("No config file at {}, using defaults", path);
    }

    apply_env_overrides(&mut merged);

    serde_json::from_value(merged).map_err(|e| format!("Invalid configuration: {}", e))
}

/// Recursive merge: objects combine key by key, everything else from the
/// overlay replaces the base wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Value) {
    if let Ok(host) = std::env::var("PYLON_HOST") {
        config["host"] = Value::String(host);
    }
    if let Ok(port) = std::env::var("PYLON_PORT") {
        if let Ok(port) = port.parse::<u16>() {
            config["port"] = Value::Number(port.into());
        }
    }
    if let Ok(secret) = std::env::var("PYLON_JWT_SECRET") {
        config["auth"]["jwt"]["secret"] = Value::String(secret);
    }
    if let Ok(url) = std::env::var("PYLON_REDIS_URL") {
        config["cache"]["redisUrl"] = Value::String(url);
    }
    if let Ok(environment) = std::env::var("PYLON_ENV") {
        config["server"]["environment"] = Value::String(environment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_combines_objects() {
        let mut base = json!({
            "port": 8080,
            "cache": {"enabled": true, "defaultTtlSecs": 300}
        });
        deep_merge(
            &mut base,
            json!({"cache": {"defaultTtlSecs": 600}, "host": "127.0.0.1"}),
        );

        assert_eq!(base["port"], 8080);
        assert_eq!(base["host"], "127.0.0.1");
        assert_eq!(base["cache"]["enabled"], true);
        assert_eq!(base["cache"]["defaultTtlSecs"], 600);
    }

    #[test]
    fn test_deep_merge_replaces_arrays() {
        let mut base = json!({"statuses": [200, 301]});
        deep_merge(&mut base, json!({"statuses": [200]}));
        assert_eq!(base["statuses"], json!([200]));
    }

    #[test]
    fn test_deep_merge_replaces_scalars() {
        let mut base = json!({"port": 8080});
        deep_merge(&mut base, json!({"port": 9090}));
        assert_eq!(base["port"], 9090);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let settings = load_settings_from("/nonexistent/pylon-config.json").unwrap();
        assert_eq!(settings.port, 8080);
        assert!(settings.routing.services.is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "port": 9000,
                "cache": {"defaultTtlSecs": 120},
                "routing": {
                    "services": [{
                        "name": "users",
                        "pathPrefix": "/api/users",
                        "instances": [{"host": "http://users.internal", "port": 8080}]
                    }]
                }
            }"#,
        )
        .unwrap();

        let settings = load_settings_from(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.cache.default_ttl_secs, 120);
        // Untouched blocks keep their defaults.
        assert_eq!(settings.rate_limit.global.max_requests, 1000);
        assert_eq!(settings.routing.services.len(), 1);
        assert_eq!(settings.routing.services[0].name, "users");
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings_from(path.to_str().unwrap()).is_err());
    }
}
