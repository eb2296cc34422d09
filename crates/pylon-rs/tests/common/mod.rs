//! Shared fixtures for the gateway integration tests: a controllable
//! upstream server and a fully assembled gateway.

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use pylon_rs::models::principal::Permission;
use pylon_rs::models::service::{
    HealthCheckConfig, LoadBalancingStrategy, ServiceDescriptor, ServiceInstance,
};
use pylon_rs::models::settings::Settings;
use pylon_rs::pipeline::Gateway;
use pylon_rs::services::auth::{AuthVerifier, InMemoryCredentialStore};
use pylon_rs::services::cache::{CacheSettings, InvalidationRule, PathTtlRule, ResponseCache};
use pylon_rs::services::monitor::GatewayMonitor;
use pylon_rs::services::plugins::PluginEngine;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub const TEST_SECRET: &str = "integration-test-secret-0123456789!!";

/// Observable state of one spawned upstream.
pub struct UpstreamState {
    pub hits: AtomicUsize,
    pub failing: AtomicBool,
    pub name: String,
}

impl UpstreamState {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

async fn upstream_handler(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<Arc<UpstreamState>>,
) -> HttpResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    if state.failing.load(Ordering::SeqCst) {
        return HttpResponse::InternalServerError().json(json!({"error": "induced failure"}));
    }

    let received: serde_json::Value = serde_json::from_slice(&body).unwrap_or(json!(null));
    let payload = json!({
        "upstream": state.name,
        "path": req.path(),
        "received": received,
    });
    if req.method() == actix_web::http::Method::POST {
        HttpResponse::Created().json(payload)
    } else {
        HttpResponse::Ok().json(payload)
    }
}

/// Starts a real upstream server on an ephemeral port.
pub async fn spawn_upstream(name: &str) -> (u16, Arc<UpstreamState>) {
    let state = Arc::new(UpstreamState {
        hits: AtomicUsize::new(0),
        failing: AtomicBool::new(false),
        name: name.to_string(),
    });

    let data = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(data.clone()))
            .default_service(web::route().to(upstream_handler))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .expect("bind upstream");
    let port = server.addrs()[0].port();
    tokio::spawn(server.run());

    (port, state)
}

pub fn instance(port: u16) -> ServiceInstance {
    ServiceInstance {
        host: "http://127.0.0.1".to_string(),
        port,
        weight: 1,
    }
}

pub fn users_service(instances: Vec<ServiceInstance>) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "users".to_string(),
        path_prefix: "/api/users".to_string(),
        strip_prefix: true,
        instances,
        load_balancing: LoadBalancingStrategy::RoundRobin,
        timeout_secs: 5,
        health_check: HealthCheckConfig {
            path: "/health".to_string(),
            // Long interval: tests drive health state directly.
            interval_secs: 3600,
            timeout_secs: 1,
        },
        circuit_breaker: None,
    }
}

pub fn base_settings(services: Vec<ServiceDescriptor>) -> Settings {
    let mut settings = Settings::default();
    settings.auth.jwt.secret = TEST_SECRET.to_string();
    settings.routing.services = services;
    settings.cache = CacheSettings {
        path_ttls: vec![PathTtlRule {
            prefix: "/api/users".to_string(),
            ttl_secs: 600,
        }],
        invalidation: vec![InvalidationRule {
            prefix: "/api/users".to_string(),
            methods: vec![
                "POST".to_string(),
                "PUT".to_string(),
                "PATCH".to_string(),
                "DELETE".to_string(),
            ],
        }],
        ..CacheSettings::default()
    };
    settings
}

/// Assembles a gateway with an in-memory credential store holding `alice`
/// (read/write) and `root` (admin).
pub async fn build_gateway(settings: Settings) -> Arc<Gateway> {
    let settings = Arc::new(settings);
    let store = Arc::new(
        InMemoryCredentialStore::new()
            .with_user("alice", "s3cret", [Permission::Read, Permission::Write])
            .with_user("root", "rootpass", [Permission::Admin]),
    );
    let verifier = Arc::new(AuthVerifier::new(settings.auth.clone(), store));
    let cache = Arc::new(ResponseCache::connect(settings.cache.clone()).await);
    let plugins = Arc::new(PluginEngine::new());
    let monitor = Arc::new(GatewayMonitor::new(settings.monitoring.clone()));

    Arc::new(Gateway::new(settings, verifier, cache, plugins, monitor))
}

/// A valid bearer token for a seeded user.
pub fn token_for(gateway: &Gateway, username: &str) -> String {
    let user = gateway
        .verifier
        .store()
        .find_user(username)
        .expect("seeded user");
    gateway.verifier.issue_token(&user).expect("token")
}
