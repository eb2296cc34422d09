//! Top-level gateway configuration.
//!
//! The configuration tree mirrors the JSON file format: each component owns
//! its own block (`rateLimit`, `cache`, `security`, ...) and the blocks are
//! aggregated here. Component-specific types live next to the component that
//! consumes them; this module only holds the root and the blocks without a
//! natural owner.
//!
//! # Configuration File Format
//!
//! ```json
//! {
//!   "port": 8080,
//!   "host": "0.0.0.0",
//!   "auth": {
//!     "jwtEnabled": true,
//!     "jwt": {"secret": "change-me-please-32-characters!!"}
//!   },
//!   "routing": {
//!     "services": [
//!       {
//!         "name": "users",
//!         "pathPrefix": "/api/users",
//!         "instances": [{"host": "http://users.internal", "port": 8080}]
//!       }
//!     ]
//!   }
//! }
//! ```

use crate::models::service::{CircuitBreakerConfig, ServiceDescriptor};
use crate::services::cache::CacheSettings;
use crate::services::monitor::MonitoringSettings;
use crate::services::rate_limit::RateLimitSettings;
use crate::services::security::SecuritySettings;
use crate::services::transform::TransformationSettings;
use serde::{Deserialize, Serialize};

/// JWT validation parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JwtSettings {
    /// Secret key used for HS256 signature validation.
    pub secret: String,
    /// Optional expected issuer for `iss` claim validation.
    #[serde(default)]
    pub issuer: Option<String>,
    /// Optional expected audience for `aud` claim validation.
    #[serde(default)]
    pub audience: Option<String>,
    /// Lifetime of tokens issued by `/auth/login` (default: 1 hour).
    #[serde(default = "default_jwt_expiry")]
    pub expiry_secs: u64,
}

fn default_jwt_expiry() -> u64 {
    3600
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: std::env::var("PYLON_JWT_SECRET")
                .unwrap_or_else(|_| "please-change-this-secret".to_string()),
            issuer: None,
            audience: None,
            expiry_secs: default_jwt_expiry(),
        }
    }
}

/// Which credential types the auth verifier accepts, and their parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(default = "default_true")]
    pub api_key_enabled: bool,
    #[serde(default = "default_true")]
    pub jwt_enabled: bool,
    #[serde(default)]
    pub basic_enabled: bool,
    /// Header carrying the API key (default: `x-api-key`).
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default)]
    pub jwt: JwtSettings,
}

fn default_true() -> bool {
    true
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            api_key_enabled: true,
            jwt_enabled: true,
            basic_enabled: false,
            api_key_header: default_api_key_header(),
            jwt: JwtSettings::default(),
        }
    }
}

/// Route table: the services the gateway fronts.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSettings {
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

/// Request-size caps enforced before a body is buffered.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LimitSettings {
    /// Maximum request body size in bytes (default: 1 MiB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Server runtime parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Graceful shutdown drain window in seconds (default: 30).
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
    /// Worker threads; 0 means one per core.
    #[serde(default)]
    pub workers: usize,
    /// Deployment environment name reported by `/health` and used to decide
    /// whether error detail is exposed (default: `development`).
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_server_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_server_timeout(),
            workers: 0,
            environment: default_environment(),
        }
    }
}

impl ServerSettings {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// OpenAPI documentation surface. Generation itself is an external concern;
/// only the toggle and mount path are recognized here.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocumentationSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_docs_path")]
    pub path: String,
}

fn default_docs_path() -> String {
    "/docs".to_string()
}

impl Default for DocumentationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_docs_path(),
        }
    }
}

/// Plugin engine toggles.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettings {
    #[serde(default)]
    pub enabled: bool,
}

/// Complete gateway configuration.
///
/// Merged from compiled defaults, an optional JSON file, and environment
/// variables; see [`crate::config::settings`] for the merge rules.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub routing: RoutingSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    /// Global circuit breaker defaults; services may override per entry.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub transformation: TransformationSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub documentation: DocumentationSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth: AuthSettings::default(),
            routing: RoutingSettings::default(),
            rate_limit: RateLimitSettings::default(),
            cache: CacheSettings::default(),
            security: SecuritySettings::default(),
            monitoring: MonitoringSettings::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            transformation: TransformationSettings::default(),
            limits: LimitSettings::default(),
            server: ServerSettings::default(),
            documentation: DocumentationSettings::default(),
            plugins: PluginSettings::default(),
        }
    }
}

impl Settings {
    /// Validates the full configuration tree, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth.jwt_enabled {
            let jwt = &self.auth.jwt;
            if jwt.secret.is_empty() {
                return Err("JWT secret cannot be empty".to_string());
            }
            if jwt.secret == "please-change-this-secret" {
                return Err("JWT secret must be changed from default value".to_string());
            }
            if jwt.secret.len() < 32 {
                return Err("JWT secret should be at least 32 characters".to_string());
            }
        }

        self.circuit_breaker.validate()?;

        for service in &self.routing.services {
            service.validate()?;
        }

        self.rate_limit.validate()?;
        self.cache.validate()?;
        self.security.validate()?;
        self.transformation.validate()?;

        Ok(())
    }

    /// Looks up the service owning a request path, longest prefix first.
    pub fn service_for_path(&self, path: &str) -> Option<&ServiceDescriptor> {
        self.routing
            .services
            .iter()
            .filter(|s| s.matches(path))
            .max_by_key(|s| s.path_prefix.len())
    }
}
