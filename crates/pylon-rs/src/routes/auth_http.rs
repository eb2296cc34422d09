//! Authentication endpoints: login, logout, refresh, profile, API keys.

use crate::models::error::GatewayError;
use crate::models::principal::{ApiKeyQuota, ApiKeyRecord, AuthMethod, Permission, Principal};
use crate::pipeline::Gateway;
use crate::services::auth::ApiKeyCredential;
use crate::utils::header_map;
use actix_web::{web, HttpRequest, HttpResponse};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub quota: Option<ApiKeyQuota>,
}

/// POST /auth/login: password check, JWT issuance.
pub async fn login(
    gateway: web::Data<Arc<Gateway>>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, GatewayError> {
    let user = gateway
        .verifier
        .authenticate_password(&body.username, &body.password)?;
    let token = gateway.verifier.issue_token(&user)?;
    info!("User {} logged in", user.username);

    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "user": {
            "id": user.id,
            "username": user.username,
            "permissions": user.permissions,
        }
    })))
}

/// POST /auth/logout: blacklists the presented bearer token.
pub async fn logout(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    let headers = header_map(&req);
    let token = bearer_token(&headers)?;
    // The token must still verify before it can be revoked.
    gateway.verifier.decode_token(token)?;
    gateway.verifier.blacklist_token(token);

    Ok(HttpResponse::Ok().json(json!({"message": "logged out"})))
}

/// POST /auth/refresh: blacklists the old token and issues a fresh one.
/// Only JWT principals may refresh.
pub async fn refresh(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    let headers = header_map(&req);
    let token = bearer_token(&headers)?;
    let principal = gateway.verifier.verify(&headers)?;
    if principal.method != AuthMethod::Jwt {
        return Err(GatewayError::Forbidden {
            reason: "refresh requires a bearer token".to_string(),
        });
    }

    let user = gateway
        .verifier
        .store()
        .find_user_by_id(&principal.id)
        .ok_or_else(|| GatewayError::Unauthenticated {
            reason: "unknown user".to_string(),
        })?;

    gateway.verifier.blacklist_token(token);
    let fresh = gateway.verifier.issue_token(&user)?;
    Ok(HttpResponse::Ok().json(json!({"token": fresh})))
}

/// GET /auth/profile: the authenticated principal.
pub async fn profile(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    let principal = gateway.verifier.verify(&header_map(&req))?;
    Ok(HttpResponse::Ok().json(json!({
        "id": principal.id,
        "method": principal.method,
        "permissions": principal.permissions,
        "apiKey": principal.api_key.as_ref().map(|k| &k.name),
    })))
}

/// POST /auth/api-keys: admin-only API key creation.
pub async fn create_api_key(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
    body: web::Json<CreateApiKeyRequest>,
) -> Result<HttpResponse, GatewayError> {
    let principal = require_admin(&req, &gateway)?;

    let permissions = body
        .permissions
        .iter()
        .map(|p| {
            Permission::parse(p).ok_or_else(|| GatewayError::Validation {
                message: format!("unknown permission: {}", p),
            })
        })
        .collect::<Result<_, _>>()?;

    let key = format!("pk_{}", uuid::Uuid::new_v4().simple());
    let credential = ApiKeyCredential {
        record: ApiKeyRecord {
            name: body.name.clone(),
            key: key.clone(),
            quota: body.quota.clone(),
        },
        owner_id: principal.id.clone(),
        permissions,
        last_used: None,
    };
    gateway.verifier.store().insert_api_key(credential);
    info!("API key {} created by {}", body.name, principal.id);

    Ok(HttpResponse::Created().json(json!({
        "name": body.name,
        "key": key,
        "quota": body.quota,
    })))
}

fn bearer_token(headers: &std::collections::HashMap<String, String>) -> Result<&str, GatewayError> {
    headers
        .get("authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| GatewayError::Unauthenticated {
            reason: "bearer token required".to_string(),
        })
}

/// Shared admin guard for management surfaces.
pub fn require_admin(
    req: &HttpRequest,
    gateway: &Gateway,
) -> Result<Principal, GatewayError> {
    let principal = gateway.verifier.verify(&header_map(req))?;
    if !principal.is_admin() {
        return Err(GatewayError::Forbidden {
            reason: "admin permission required".to_string(),
        });
    }
    Ok(principal)
}

pub fn configure_auth_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/login", web::post().to(login))
            .route("/logout", web::post().to(logout))
            .route("/refresh", web::post().to(refresh))
            .route("/profile", web::get().to(profile))
            .route("/api-keys", web::post().to(create_api_key)),
    );
}
