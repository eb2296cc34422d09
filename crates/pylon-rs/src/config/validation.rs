//! Comprehensive configuration validation with errors and warnings.
//!
//! Hard errors stop startup; warnings are logged and the gateway proceeds.

use crate::models::settings::Settings;

/// Result of a full configuration validation pass.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the configuration tree and collects advisory warnings.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult {
            is_valid: true,
            ..ValidationResult::default()
        };

        if let Err(e) = settings.validate() {
            result.errors.push(e);
            result.is_valid = false;
        }

        if settings.routing.services.is_empty() {
            result
                .warnings
                .push("No services configured; every /api request will return 404".to_string());
        }

        for service in &settings.routing.services {
            if service.instances.len() == 1 {
                result.warnings.push(format!(
                    "Service {} has a single instance and no failover",
                    service.name
                ));
            }
            if service.health_check.timeout_secs >= service.health_check.interval_secs {
                result.warnings.push(format!(
                    "Service {} health probe timeout is not below its interval",
                    service.name
                ));
            }
            if !service.path_prefix.starts_with("/api/") {
                result.warnings.push(format!(
                    "Service {} is mounted outside /api and bypasses the circuit breaker key derivation",
                    service.name
                ));
            }
        }

        if !settings.cache.enabled {
            result
                .warnings
                .push("Response cache is disabled; every request hits upstream".to_string());
        } else if settings.cache.redis_url.is_none() {
            result.warnings.push(
                "No cache store URL configured; running on the in-process tier only".to_string(),
            );
        }

        if settings.server.is_production() && !settings.auth.jwt_enabled {
            result
                .warnings
                .push("JWT authentication is disabled in production".to_string());
        }

        result
    }
}
