//! Admin-only management surface: services, routes, cache, plugins.

use crate::models::error::GatewayError;
use crate::pipeline::Gateway;
use crate::routes::auth_http::require_admin;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// GET /admin/services: descriptors with live health and circuit state.
pub async fn list_services(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    Ok(HttpResponse::Ok().json(json!({
        "services": gateway.settings.routing.services,
        "health": gateway.health.snapshot(),
        "circuits": gateway.circuits.snapshots(),
    })))
}

/// GET /admin/routes: the route table summary.
pub async fn list_routes(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    let routes: Vec<_> = gateway
        .settings
        .routing
        .services
        .iter()
        .map(|s| {
            json!({
                "pathPrefix": s.path_prefix,
                "service": s.name,
                "stripPrefix": s.strip_prefix,
                "loadBalancing": s.load_balancing,
                "instances": s.instances.len(),
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(json!({"routes": routes})))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    /// Path prefix whose entries are dropped.
    pub prefix: String,
}

/// POST /admin/cache/invalidate: manual keyed invalidation.
pub async fn invalidate_cache(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
    body: web::Json<InvalidateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    let removed = gateway.cache.invalidate_prefix(&body.prefix).await;
    Ok(HttpResponse::Ok().json(json!({"invalidated": removed})))
}

/// POST /admin/cache/flush: drop every cached entry.
pub async fn flush_cache(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    let removed = gateway.cache.flush().await;
    Ok(HttpResponse::Ok().json(json!({"flushed": removed})))
}

/// GET /admin/plugins: registered plugin metadata.
pub async fn list_plugins(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    Ok(HttpResponse::Ok().json(json!({"plugins": gateway.plugins.list()})))
}

/// DELETE /admin/plugins/{name}: unload one plugin.
pub async fn unload_plugin(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
    name: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&req, &gateway)?;
    if gateway.plugins.unload(&name) {
        Ok(HttpResponse::Ok().json(json!({"unloaded": name.as_str()})))
    } else {
        Err(GatewayError::NotFound {
            path: format!("/admin/plugins/{}", name),
        })
    }
}

pub fn configure_admin(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/services", web::get().to(list_services))
            .route("/routes", web::get().to(list_routes))
            .route("/cache/invalidate", web::post().to(invalidate_cache))
            .route("/cache/flush", web::post().to(flush_cache))
            .route("/plugins", web::get().to(list_plugins))
            .route("/plugins/{name}", web::delete().to(unload_plugin)),
    );
}
