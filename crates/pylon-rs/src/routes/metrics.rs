use crate::models::error::GatewayError;
use crate::pipeline::Gateway;
use crate::utils::header_map;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use std::sync::Arc;

/// Admin-only monitoring snapshot: counters, averages, alerts, and circuit
/// states.
pub async fn metrics_endpoint(
    req: HttpRequest,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, GatewayError> {
    let principal = gateway.verifier.verify(&header_map(&req))?;
    if !principal.is_admin() {
        return Err(GatewayError::Forbidden {
            reason: "metrics require the admin permission".to_string(),
        });
    }

    let mut snapshot = gateway.monitor.snapshot();
    snapshot["circuits"] = json!(gateway.circuits.snapshots());
    Ok(HttpResponse::Ok().json(snapshot))
}

pub fn configure_metrics(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_endpoint));
}
