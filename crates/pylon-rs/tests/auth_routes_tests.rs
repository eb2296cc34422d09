//! The authentication and administration HTTP surface.

mod common;

use actix_web::{test, web, App};
use common::*;
use pylon_rs::routes::{admin, auth_http, metrics};
use serde_json::{json, Value};

macro_rules! auth_app {
    ($gateway:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($gateway.clone()))
                .configure(auth_http::configure_auth_routes)
                .configure(metrics::configure_metrics)
                .configure(admin::configure_admin),
        )
        .await
    };
}

#[actix_web::test]
async fn test_login_returns_token_and_user() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({"username": "alice", "password": "s3cret"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["token"].as_str().is_some());
    assert_eq!(body["user"]["username"], "alice");

    // The returned token verifies.
    let token = body["token"].as_str().unwrap();
    let claims = gateway.verifier.decode_token(token).unwrap();
    assert!(!claims.sub.is_empty());
}

#[actix_web::test]
async fn test_login_rejects_wrong_password() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/login")
            .set_json(json!({"username": "alice", "password": "wrong"}))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn test_logout_blacklists_token() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);
    let token = token_for(&gateway, "alice");

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/logout")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(gateway.verifier.is_blacklisted(&token));

    // The blacklisted token no longer works on authenticated endpoints.
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/auth/profile")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn test_refresh_rotates_token() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);
    let token = token_for(&gateway, "alice");

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/refresh")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    let fresh = body["token"].as_str().unwrap();

    // Old token revoked, new token valid.
    assert!(gateway.verifier.is_blacklisted(&token));
    assert!(!gateway.verifier.is_blacklisted(fresh));
    assert!(gateway.verifier.decode_token(fresh).is_ok());
}

#[actix_web::test]
async fn test_profile_reflects_principal() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);
    let token = token_for(&gateway, "root");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/auth/profile")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["method"], "jwt");
    assert!(body["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p == "admin"));
}

#[actix_web::test]
async fn test_api_key_creation_requires_admin() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);

    let request = json!({"name": "ci-key", "permissions": ["read"]});

    // Non-admin is refused.
    let alice = token_for(&gateway, "alice");
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/api-keys")
            .insert_header(("Authorization", format!("Bearer {}", alice)))
            .set_json(&request)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 403);

    // Admin succeeds and the key authenticates.
    let root = token_for(&gateway, "root");
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/auth/api-keys")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .set_json(&request)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 201);
    let body: Value = test::read_body_json(resp).await;
    let key = body["key"].as_str().unwrap();
    assert!(key.starts_with("pk_"));

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/auth/profile")
            .insert_header(("x-api-key", key))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["method"], "api_key");
    assert_eq!(body["apiKey"], "ci-key");
}

#[actix_web::test]
async fn test_metrics_requires_admin() {
    let gateway = build_gateway(base_settings(vec![])).await;
    let app = auth_app!(gateway);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), 401);

    let alice = token_for(&gateway, "alice");
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/metrics")
            .insert_header(("Authorization", format!("Bearer {}", alice)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 403);

    let root = token_for(&gateway, "root");
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/metrics")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["requests"]["total"].is_number());
    assert!(body["circuits"].is_array());
}

#[actix_web::test]
async fn test_admin_cache_flush_and_service_listing() {
    let gateway = build_gateway(base_settings(vec![users_service(vec![instance(1)])])).await;
    let app = auth_app!(gateway);
    let root = token_for(&gateway, "root");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/admin/services")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["services"][0]["name"], "users");
    assert!(body["health"]["users"].is_object());

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/admin/cache/flush")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["flushed"].is_number());
}

#[actix_web::test]
async fn test_admin_plugin_listing_and_unload() {
    use pylon_rs::services::plugins::{
        ContextOverride, GatewayPlugin, HookContext, HookKind, PluginMetadata,
    };
    use std::sync::Arc;

    struct NoopPlugin;
    impl GatewayPlugin for NoopPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                name: "noop".into(),
                version: "0.1.0".into(),
                description: "does nothing".into(),
                author: "tests".into(),
            }
        }
        fn hooks(&self) -> Vec<HookKind> {
            vec![HookKind::BeforeRequest]
        }
        fn on_hook(
            &self,
            _hook: HookKind,
            _ctx: &HookContext,
        ) -> Result<Option<ContextOverride>, String> {
            Ok(None)
        }
    }

    let gateway = build_gateway(base_settings(vec![])).await;
    gateway.plugins.register(Arc::new(NoopPlugin));
    let app = auth_app!(gateway);
    let root = token_for(&gateway, "root");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/admin/plugins")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["plugins"][0]["name"], "noop");

    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/admin/plugins/noop")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &app,
        test::TestRequest::delete()
            .uri("/admin/plugins/noop")
            .insert_header(("Authorization", format!("Bearer {}", root)))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}
