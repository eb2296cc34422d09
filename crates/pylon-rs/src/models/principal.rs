//! Authenticated identity attached to a request.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the caller proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Basic,
}

/// Coarse-grained permissions granted to a principal.
///
/// `Admin` implies every other permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

impl Permission {
    /// Parses a permission name as it appears in credential records.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "delete" => Some(Permission::Delete),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// Per-key quota override carried by an API key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyQuota {
    /// Requests allowed per window.
    pub max_requests: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

/// API key metadata attached to a principal authenticated via API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Human-readable key name assigned at creation time.
    pub name: String,
    /// The key value itself, used as the quota bucket key.
    pub key: String,
    /// Optional per-key quota overriding the configured default.
    pub quota: Option<ApiKeyQuota>,
}

/// The authenticated identity for one request.
///
/// Constructed by the auth verifier from the presented credential and never
/// cached across requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identity of the caller (user id or API key owner id).
    pub id: String,
    /// Credential type that authenticated this request.
    pub method: AuthMethod,
    /// Granted permission set.
    pub permissions: HashSet<Permission>,
    /// Present when `method` is `ApiKey`.
    pub api_key: Option<ApiKeyRecord>,
}

impl Principal {
    pub fn new(id: impl Into<String>, method: AuthMethod) -> Self {
        Self {
            id: id.into(),
            method,
            permissions: HashSet::new(),
            api_key: None,
        }
    }

    pub fn with_permissions<I>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = Permission>,
    {
        self.permissions = permissions.into_iter().collect();
        self
    }

    /// Checks a permission, honoring the admin-implies-all rule.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(&Permission::Admin)
    }

    /// The quota bucket key for this principal.
    ///
    /// API key principals are accounted per key, everything else per user id.
    pub fn quota_key(&self) -> String {
        match (&self.method, &self.api_key) {
            (AuthMethod::ApiKey, Some(record)) => format!("apikey:{}", record.key),
            _ => format!("user:{}", self.id),
        }
    }
}
