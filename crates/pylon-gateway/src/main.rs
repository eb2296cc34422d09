//! Pylon API Gateway server.
//!
//! Binary entry point: loads and validates configuration, assembles the
//! pipeline with its stateful controllers, spawns the background loops
//! (health checker, cache sweeper, quota sweeper, system sampler), and runs
//! the HTTP server until shutdown.

use pylon_rs::config::settings::load_settings;
use pylon_rs::config::validation::ConfigValidator;
use pylon_rs::logs::logger::configure_logger;
use pylon_rs::middleware::security::security_headers;
use pylon_rs::models::principal::Permission;
use pylon_rs::models::settings::Settings;
use pylon_rs::pipeline::Gateway;
use pylon_rs::routes::{admin, auth_http, health, http, metrics};
use pylon_rs::services::auth::{AuthVerifier, InMemoryCredentialStore};
use pylon_rs::services::cache::ResponseCache;
use pylon_rs::services::health::HealthChecker;
use pylon_rs::services::monitor::GatewayMonitor;
use pylon_rs::services::plugins::PluginEngine;

use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let settings: Settings = match load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Pylon API Gateway v{}", env!("CARGO_PKG_VERSION"));

    let validation = ConfigValidator::validate_comprehensive(&settings);
    for warning in &validation.warnings {
        warn!("Config: {}", warning);
    }
    if !validation.is_valid {
        error!("Configuration validation failed:");
        for e in &validation.errors {
            error!("  - {}", e);
        }
        std::process::exit(1);
    }
    info!(
        "Configuration validated with {} warnings",
        validation.warnings.len()
    );

    let settings = Arc::new(settings);

    // Credential store seeding; a real deployment points the verifier at an
    // external store instead.
    let admin_user =
        std::env::var("PYLON_ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
    let admin_password =
        std::env::var("PYLON_ADMIN_PASSWORD").unwrap_or_else(|_| "changeme".to_string());
    if admin_password == "changeme" {
        warn!("PYLON_ADMIN_PASSWORD not set, using the default admin password");
    }
    let store = Arc::new(InMemoryCredentialStore::new().with_user(
        &admin_user,
        &admin_password,
        [Permission::Admin],
    ));
    let verifier = Arc::new(AuthVerifier::new(settings.auth.clone(), store));

    let cache = Arc::new(ResponseCache::connect(settings.cache.clone()).await);
    let plugins = Arc::new(PluginEngine::new());
    let monitor = Arc::new(GatewayMonitor::new(settings.monitoring.clone()));

    let gateway = Arc::new(Gateway::new(
        settings.clone(),
        verifier,
        cache.clone(),
        plugins.clone(),
        monitor.clone(),
    ));

    plugins.fire_startup();

    // Background loops, all cancelled through one watch channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();
    background.extend(
        HealthChecker::new(gateway.health.clone())
            .spawn(settings.routing.services.clone(), shutdown_rx.clone()),
    );
    background.push(cache.spawn_sweeper(shutdown_rx.clone()));
    background.push(
        gateway
            .limiter
            .spawn_sweeper(Duration::from_secs(300), shutdown_rx.clone()),
    );
    background.push(monitor.clone().spawn_sampler(shutdown_rx.clone()));

    let host = settings.host.clone();
    let port = settings.port;
    let max_body = settings.limits.max_body_bytes;
    let workers = settings.server.workers;
    let drain_secs = settings.server.timeout_secs;

    info!("Listening on {}:{}", host, port);

    let gateway_data = web::Data::new(gateway.clone());
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(gateway_data.clone())
            .app_data(web::PayloadConfig::new(max_body))
            .wrap(Logger::new(
                r#"%a "%r" %s %b "%{Referer}i" "%{User-Agent}i" %T"#,
            ))
            .wrap(actix_web::middleware::Compress::default())
            .wrap(security_headers())
            .configure(health::configure_health)
            .configure(metrics::configure_metrics)
            .configure(auth_http::configure_auth_routes)
            .configure(admin::configure_admin)
            .configure(http::configure_proxy)
    })
    .shutdown_timeout(drain_secs);
    if workers > 0 {
        server = server.workers(workers);
    }
    let server = server.bind((host.as_str(), port))?.run();

    info!("Server started");

    let mut exit_code = 0;
    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("Server stopped"),
                Err(e) => {
                    error!("Server error: {}", e);
                    exit_code = 1;
                }
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, draining");
        }
    }

    // Stop the background loops, then let plugins clean up, reverse order.
    let _ = shutdown_tx.send(true);
    for task in background {
        task.abort();
    }
    plugins.fire_shutdown();
    info!("Shutdown complete");

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
