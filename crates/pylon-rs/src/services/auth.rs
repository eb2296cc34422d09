//! Credential verification and principal construction.
//!
//! The verifier resolves an API key, bearer JWT, or basic credential to a
//! [`Principal`]. Credential storage itself is an external collaborator: the
//! gateway only pins the narrow [`CredentialStore`] seam and ships an
//! in-memory implementation for standalone deployments and tests.
//!
//! Method precedence is fixed: API key header first, then bearer token, then
//! basic. The first credential that parses is authoritative; if it fails to
//! verify the request is rejected without trying the remaining methods.

use crate::models::error::GatewayError;
use crate::models::principal::{ApiKeyRecord, AuthMethod, Permission, Principal};
use crate::models::settings::AuthSettings;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// JWT claims carried by gateway-issued tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Stored user credential.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    /// Hex-encoded SHA-256 of the password.
    pub password_hash: String,
    pub permissions: HashSet<Permission>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Stored API key credential.
#[derive(Debug, Clone)]
pub struct ApiKeyCredential {
    pub record: ApiKeyRecord,
    pub owner_id: String,
    pub permissions: HashSet<Permission>,
    pub last_used: Option<DateTime<Utc>>,
}

/// The credential store seam.
///
/// Implementations must be cheap to call on the request path; the verifier
/// only reads records and touch-stamps `last_used`, never mutates anything
/// else.
pub trait CredentialStore: Send + Sync {
    fn find_user(&self, username: &str) -> Option<UserRecord>;
    fn find_user_by_id(&self, id: &str) -> Option<UserRecord>;
    fn find_api_key(&self, key: &str) -> Option<ApiKeyCredential>;
    fn touch_user(&self, id: &str);
    fn touch_api_key(&self, key: &str);
    fn insert_api_key(&self, credential: ApiKeyCredential);
}

/// In-memory credential store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<String, UserRecord>>,
    api_keys: RwLock<HashMap<String, ApiKeyCredential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        self,
        username: &str,
        password: &str,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        let record = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash_password(password),
            permissions: permissions.into_iter().collect(),
            last_used: None,
        };
        self.users
            .write()
            .unwrap()
            .insert(username.to_string(), record);
        self
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn find_user(&self, username: &str) -> Option<UserRecord> {
        self.users.read().unwrap().get(username).cloned()
    }

    fn find_user_by_id(&self, id: &str) -> Option<UserRecord> {
        self.users
            .read()
            .unwrap()
            .values()
            .find(|u| u.id == id)
            .cloned()
    }

    fn find_api_key(&self, key: &str) -> Option<ApiKeyCredential> {
        self.api_keys.read().unwrap().get(key).cloned()
    }

    fn touch_user(&self, id: &str) {
        let mut users = self.users.write().unwrap();
        if let Some(user) = users.values_mut().find(|u| u.id == id) {
            user.last_used = Some(Utc::now());
        }
    }

    fn touch_api_key(&self, key: &str) {
        let mut keys = self.api_keys.write().unwrap();
        if let Some(credential) = keys.get_mut(key) {
            credential.last_used = Some(Utc::now());
        }
    }

    fn insert_api_key(&self, credential: ApiKeyCredential) {
        self.api_keys
            .write()
            .unwrap()
            .insert(credential.record.key.clone(), credential);
    }
}

pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Resolves request credentials to principals.
pub struct AuthVerifier {
    settings: AuthSettings,
    store: Arc<dyn CredentialStore>,
    blacklist: RwLock<HashSet<String>>,
}

impl AuthVerifier {
    pub fn new(settings: AuthSettings, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            settings,
            store,
            blacklist: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Verifies the request headers and builds a principal.
    pub fn verify(&self, headers: &HashMap<String, String>) -> Result<Principal, GatewayError> {
        if self.settings.api_key_enabled {
            if let Some(key) = headers.get(&self.settings.api_key_header.to_ascii_lowercase()) {
                return self.verify_api_key(key);
            }
        }

        let authorization = headers.get("authorization").map(String::as_str);

        if self.settings.jwt_enabled {
            if let Some(token) = authorization.and_then(|v| v.strip_prefix("Bearer ")) {
                return self.verify_bearer(token);
            }
        }

        if self.settings.basic_enabled {
            if let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) {
                return self.verify_basic(encoded);
            }
        }

        Err(GatewayError::Unauthenticated {
            reason: "no recognized credentials presented".to_string(),
        })
    }

    fn verify_api_key(&self, key: &str) -> Result<Principal, GatewayError> {
        let credential = self.store.find_api_key(key).ok_or_else(|| {
            warn!("Unknown API key presented");
            GatewayError::Unauthenticated {
                reason: "invalid API key".to_string(),
            }
        })?;

        self.store.touch_api_key(key);
        debug!("Authenticated API key {}", credential.record.name);

        let mut principal = Principal::new(credential.owner_id, AuthMethod::ApiKey)
            .with_permissions(credential.permissions);
        principal.api_key = Some(credential.record);
        Ok(principal)
    }

    fn verify_bearer(&self, token: &str) -> Result<Principal, GatewayError> {
        if self.blacklist.read().unwrap().contains(token) {
            return Err(GatewayError::TokenBlacklisted);
        }

        let claims = self.decode_token(token)?;
        self.store.touch_user(&claims.sub);

        let permissions = claims
            .permissions
            .iter()
            .filter_map(|p| Permission::parse(p))
            .collect::<Vec<_>>();

        Ok(Principal::new(claims.sub, AuthMethod::Jwt).with_permissions(permissions))
    }

    fn verify_basic(&self, encoded: &str) -> Result<Principal, GatewayError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::Unauthenticated {
                reason: "malformed basic credentials".to_string(),
            })?;
        let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::Unauthenticated {
            reason: "malformed basic credentials".to_string(),
        })?;
        let (username, password) =
            decoded
                .split_once(':')
                .ok_or_else(|| GatewayError::Unauthenticated {
                    reason: "malformed basic credentials".to_string(),
                })?;

        let user = self.authenticate_password(username, password)?;
        self.store.touch_user(&user.id);
        Ok(Principal::new(user.id, AuthMethod::Basic).with_permissions(user.permissions))
    }

    /// Password check shared by basic auth and `/auth/login`.
    pub fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserRecord, GatewayError> {
        let user = self
            .store
            .find_user(username)
            .ok_or_else(|| GatewayError::Unauthenticated {
                reason: "invalid username or password".to_string(),
            })?;
        if user.password_hash != hash_password(password) {
            return Err(GatewayError::Unauthenticated {
                reason: "invalid username or password".to_string(),
            });
        }
        Ok(user)
    }

    /// Issues a signed JWT for a user.
    pub fn issue_token(&self, user: &UserRecord) -> Result<String, GatewayError> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user.id.clone(),
            exp: now + self.settings.jwt.expiry_secs as usize,
            iat: now,
            iss: self.settings.jwt.issuer.clone(),
            aud: self.settings.jwt.audience.clone(),
            permissions: user
                .permissions
                .iter()
                .map(|p| format!("{:?}", p).to_lowercase())
                .collect(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.settings.jwt.secret.as_ref()),
        )
        .map_err(|e| GatewayError::Internal {
            message: format!("token signing failed: {}", e),
        })
    }

    pub fn decode_token(&self, token: &str) -> Result<Claims, GatewayError> {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &self.settings.jwt.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.settings.jwt.audience {
            validation.set_audience(&[audience]);
        }

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.settings.jwt.secret.as_ref()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| {
            debug!("Token validation failed: {}", e);
            GatewayError::Unauthenticated {
                reason: "invalid or expired token".to_string(),
            }
        })
    }

    /// Blacklists a token until process restart.
    pub fn blacklist_token(&self, token: &str) {
        self.blacklist.write().unwrap().insert(token.to_string());
    }

    pub fn is_blacklisted(&self, token: &str) -> bool {
        self.blacklist.read().unwrap().contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::principal::ApiKeyQuota;

    fn settings() -> AuthSettings {
        AuthSettings {
            api_key_enabled: true,
            jwt_enabled: true,
            basic_enabled: true,
            api_key_header: "x-api-key".into(),
            jwt: crate::models::settings::JwtSettings {
                secret: "unit-test-secret-with-enough-length!".into(),
                issuer: None,
                audience: None,
                expiry_secs: 3600,
            },
        }
    }

    fn verifier() -> AuthVerifier {
        let store = InMemoryCredentialStore::new().with_user(
            "alice",
            "s3cret",
            [Permission::Read, Permission::Write],
        );
        store.insert_api_key(ApiKeyCredential {
            record: ApiKeyRecord {
                name: "ci".into(),
                key: "pk_test_123".into(),
                quota: Some(ApiKeyQuota {
                    max_requests: 10,
                    window_ms: 60_000,
                }),
            },
            owner_id: "svc-ci".into(),
            permissions: [Permission::Read].into_iter().collect(),
            last_used: None,
        });
        AuthVerifier::new(settings(), Arc::new(store))
    }

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_credentials() {
        let verifier = verifier();
        let err = verifier.verify(&headers(&[])).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated { .. }));
    }

    #[test]
    fn test_api_key_flow() {
        let verifier = verifier();
        let principal = verifier
            .verify(&headers(&[("x-api-key", "pk_test_123")]))
            .unwrap();
        assert_eq!(principal.method, AuthMethod::ApiKey);
        assert_eq!(principal.id, "svc-ci");
        assert!(principal.has_permission(Permission::Read));
        assert!(!principal.has_permission(Permission::Write));
        assert_eq!(
            principal.api_key.as_ref().unwrap().quota.as_ref().unwrap().max_requests,
            10
        );

        // last_used was touch-stamped.
        let credential = verifier.store().find_api_key("pk_test_123").unwrap();
        assert!(credential.last_used.is_some());
    }

    #[test]
    fn test_invalid_api_key_does_not_fall_through() {
        let verifier = verifier();
        // A parseable-but-unknown API key must fail even though a valid
        // basic credential is also present.
        let user_pass = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let err = verifier
            .verify(&headers(&[
                ("x-api-key", "pk_bogus"),
                ("authorization", &format!("Basic {}", user_pass)),
            ]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated { .. }));
    }

    #[test]
    fn test_jwt_roundtrip() {
        let verifier = verifier();
        let user = verifier.store().find_user("alice").unwrap();
        let token = verifier.issue_token(&user).unwrap();

        let principal = verifier
            .verify(&headers(&[("authorization", &format!("Bearer {}", token))]))
            .unwrap();
        assert_eq!(principal.method, AuthMethod::Jwt);
        assert_eq!(principal.id, user.id);
        assert!(principal.has_permission(Permission::Write));
    }

    #[test]
    fn test_blacklisted_token_rejected() {
        let verifier = verifier();
        let user = verifier.store().find_user("alice").unwrap();
        let token = verifier.issue_token(&user).unwrap();
        verifier.blacklist_token(&token);

        let err = verifier
            .verify(&headers(&[("authorization", &format!("Bearer {}", token))]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::TokenBlacklisted));
    }

    #[test]
    fn test_garbage_bearer_rejected() {
        let verifier = verifier();
        let err = verifier
            .verify(&headers(&[("authorization", "Bearer not.a.token")]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated { .. }));
    }

    #[test]
    fn test_basic_auth() {
        let verifier = verifier();
        let good = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let principal = verifier
            .verify(&headers(&[("authorization", &format!("Basic {}", good))]))
            .unwrap();
        assert_eq!(principal.method, AuthMethod::Basic);

        let bad = base64::engine::general_purpose::STANDARD.encode("alice:wrong");
        assert!(verifier
            .verify(&headers(&[("authorization", &format!("Basic {}", bad))]))
            .is_err());
    }

    #[test]
    fn test_password_hashing_is_stable() {
        assert_eq!(hash_password("x"), hash_password("x"));
        assert_ne!(hash_password("x"), hash_password("y"));
    }
}
