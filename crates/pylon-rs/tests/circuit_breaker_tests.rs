//! Circuit breaker behavior through the full pipeline: opening on upstream
//! errors, fast failure with Retry-After, half-open probing, and recovery.

mod common;

use actix_web::{test, web, App};
use common::*;
use pylon_rs::models::service::CircuitBreakerConfig;
use pylon_rs::services::circuit_breaker::{CircuitBreaker, CircuitState};
use serde_json::Value;
use std::time::Duration;

#[actix_web::test]
async fn test_breaker_opens_after_upstream_errors_and_recovers() {
    let (port, upstream) = spawn_upstream("flaky").await;
    let mut service = users_service(vec![instance(port)]);
    service.circuit_breaker = Some(CircuitBreakerConfig {
        timeout_ms: 5000,
        error_count: 3,
        error_threshold: 50,
        reset_timeout_ms: 1000,
        half_open_requests: 3,
    });
    let mut settings = base_settings(vec![service]);
    // Cache would mask repeated calls to the same path.
    settings.cache.enabled = false;
    let gateway = build_gateway(settings).await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(gateway.clone()))
            .configure(pylon_rs::routes::http::configure_proxy),
    )
    .await;
    let token = token_for(&gateway, "alice");

    let call = |i: u32| {
        test::TestRequest::get()
            .uri(&format!("/api/users/{}", i))
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request()
    };

    // Three upstream 500s in a row pass through while the breaker counts.
    upstream.set_failing(true);
    for i in 0..3 {
        let resp = test::call_service(&app, call(i)).await;
        assert_eq!(resp.status(), 500);
    }

    // The fourth request is rejected without touching the upstream.
    let hits_before = upstream.hits();
    let resp = test::call_service(&app, call(3)).await;
    assert_eq!(resp.status(), 503);
    assert_eq!(resp.headers().get("retry-after").unwrap(), "1");
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "circuit_open");
    assert_eq!(body["service"], "users");
    assert_eq!(upstream.hits(), hits_before);

    // After the reset window the next request is admitted as a half-open
    // probe; three consecutive successes close the circuit.
    upstream.set_failing(false);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    for i in 4..7 {
        let resp = test::call_service(&app, call(i)).await;
        assert_eq!(resp.status(), 200);
    }
    let snapshot = gateway
        .circuits
        .snapshots()
        .into_iter()
        .find(|s| s.service == "users")
        .expect("circuit exists");
    assert_eq!(snapshot.state, "closed");
}

#[tokio::test]
async fn test_open_circuit_is_monotonic_until_reset_timeout() {
    let breaker = CircuitBreaker::new(
        "users".into(),
        CircuitBreakerConfig {
            timeout_ms: 1000,
            error_count: 1,
            error_threshold: 1,
            reset_timeout_ms: 300,
            half_open_requests: 1,
        },
    );

    let permit = breaker.try_acquire().unwrap();
    breaker.record_failure(permit, false);
    assert_eq!(breaker.state(), CircuitState::Open);

    // Hammer the breaker during the reset window: it must stay open and
    // reject everything.
    let deadline = std::time::Instant::now() + Duration::from_millis(250);
    while std::time::Instant::now() < deadline {
        assert!(breaker.try_acquire().is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Once the window elapses the next acquire flips to half-open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let permit = breaker.try_acquire().unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_success(permit);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[actix_web::test]
async fn test_upstream_timeout_counts_as_breaker_failure() {
    // Nothing listens on this socket fast enough: use a blackhole address
    // with a very short breaker timeout.
    let mut service = users_service(vec![pylon_rs::models::service::ServiceInstance {
        host: "http://192.0.2.1".to_string(),
        port: 81,
        weight: 1,
    }]);
    service.circuit_breaker = Some(CircuitBreakerConfig {
        timeout_ms: 200,
        error_count: 1,
        error_threshold: 1,
        reset_timeout_ms: 60_000,
        half_open_requests: 1,
    });
    let mut settings = base_settings(vec![service]);
    settings.cache.enabled = false;
    let gateway = build_gateway(settings).await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(gateway.clone()))
            .configure(pylon_rs::routes::http::configure_proxy),
    )
    .await;
    let token = token_for(&gateway, "alice");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/users/1")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    // 504 on timeout, 502 if the connect fails outright; either way the
    // breaker recorded a failure and opened.
    assert!(resp.status() == 504 || resp.status() == 502);

    let snapshot = gateway
        .circuits
        .snapshots()
        .into_iter()
        .find(|s| s.service == "users")
        .expect("circuit exists");
    assert_eq!(snapshot.state, "open");
    assert_eq!(snapshot.failures, 1);
}

#[actix_web::test]
async fn test_breaker_bypassed_outside_api_namespace() {
    // No /api prefix and no x-service-name header: requests proceed
    // without circuit accounting.
    let (port, _upstream) = spawn_upstream("a").await;
    let mut service = users_service(vec![instance(port)]);
    service.path_prefix = "/internal/users".to_string();
    let mut settings = base_settings(vec![service]);
    settings.cache.enabled = false;
    let gateway = build_gateway(settings).await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(gateway.clone()))
            .route(
                "/internal/{tail:.*}",
                web::route().to(pylon_rs::routes::http::proxy_entry),
            ),
    )
    .await;
    let token = token_for(&gateway, "alice");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/internal/users/1")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(gateway.circuits.snapshots().is_empty());
}
