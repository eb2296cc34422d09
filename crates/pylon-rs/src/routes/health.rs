use crate::pipeline::Gateway;
use actix_web::{web, HttpResponse, Result};
use serde_json::json;

/// Unauthenticated health endpoint with the per-instance health map.
pub async fn health_check(gateway: web::Data<std::sync::Arc<Gateway>>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime": gateway.monitor.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": gateway.settings.server.environment,
        "services": gateway.health.snapshot(),
    })))
}

pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check));
}
