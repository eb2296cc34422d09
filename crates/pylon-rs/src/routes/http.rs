//! The proxy entry point: every `/api/...` request runs the full pipeline.

use crate::models::context::RequestContext;
use crate::pipeline::Gateway;
use crate::utils::{client_ip, header_map, query_map};
use actix_web::{web, HttpRequest, HttpResponse};
use std::sync::Arc;

/// Builds the request context and hands it to the orchestrator.
pub async fn proxy_entry(
    req: HttpRequest,
    body: web::Bytes,
    gateway: web::Data<Arc<Gateway>>,
) -> HttpResponse {
    let mut ctx = RequestContext::new(client_ip(&req), req.method().as_str(), req.path());
    ctx.headers = header_map(&req);
    ctx.query = query_map(req.query_string());
    ctx.body = body;

    let is_json = ctx
        .header("content-type")
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    if is_json && !ctx.body.is_empty() {
        ctx.body_json = serde_json::from_slice(&ctx.body).ok();
    }

    gateway.handle(ctx).await
}

pub fn configure_proxy(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/{tail:.*}", web::route().to(proxy_entry));
}
