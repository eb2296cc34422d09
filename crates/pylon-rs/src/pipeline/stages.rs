//! The concrete pipeline stages, in the order they run.
//!
//! Each stage wraps one service and adapts it to the [`PipelineStage`]
//! interface. Stages never build error bodies; they fail with a typed
//! [`GatewayError`](crate::models::error::GatewayError) and leave the
//! mapping to the orchestrator.

use crate::models::context::{CacheDecision, GatewayResponse, RequestContext};
use crate::models::error::GatewayError;
use crate::models::settings::Settings;
use crate::pipeline::stage::{PipelineStage, StageOutcome};
use crate::services::cache::{CacheEntry, ResponseCache};
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::health::HealthRegistry;
use crate::services::load_balancer::LoadBalancer;
use crate::services::proxy::ReverseProxy;
use crate::services::rate_limit::RateLimiter;
use crate::services::security::SecurityFilter;
use crate::services::transform::Transformer;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// IP lists, input caps, and threat scanning. Runs first.
pub struct SecurityStage {
    pub filter: Arc<SecurityFilter>,
}

impl PipelineStage for SecurityStage {
    fn name(&self) -> &'static str {
        "security"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            if let Err(e) = self.filter.check_ip(&ctx.client_ip) {
                return StageOutcome::Fail(e);
            }
            let body_text = if ctx.body_json.is_none() && !ctx.body.is_empty() {
                Some(String::from_utf8_lossy(&ctx.body).into_owned())
            } else {
                None
            };
            match self.filter.inspect(
                &ctx.client_ip,
                &ctx.query,
                &ctx.headers,
                ctx.body_json.as_ref(),
                body_text.as_deref(),
            ) {
                Ok(()) => StageOutcome::Continue,
                Err(e) => StageOutcome::Fail(e),
            }
        }
        .boxed_local()
    }
}

/// Global per-IP window plus the slow-down policy. The per-identity quota
/// runs later, once the auth stage has built a principal.
pub struct RateLimitStage {
    pub limiter: Arc<RateLimiter>,
}

impl PipelineStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let decision = self.limiter.check_global(&ctx.client_ip);
            ctx.records.quota = Some(decision.state);
            if !decision.allowed {
                return StageOutcome::Fail(GatewayError::RateLimited {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "global rate limit exceeded".to_string()),
                    limit: decision.state.limit,
                    reset_secs: decision.state.reset_secs,
                });
            }
            if let Some(delay) = self.limiter.slow_down_delay(&ctx.client_ip) {
                tokio::time::sleep(delay).await;
            }
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Request-side transformation rules and query sanitization.
pub struct RequestTransformStage {
    pub transformer: Arc<Transformer>,
}

impl PipelineStage for RequestTransformStage {
    fn name(&self) -> &'static str {
        "request_transform"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let path = ctx.path.clone();
            let mut body = ctx.body_json.take();
            self.transformer
                .apply_request(&path, &mut ctx.headers, &mut ctx.query, &mut body);
            ctx.body_json = body;
            ctx.sync_body_from_json();
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Credential verification.
pub struct AuthStage {
    pub verifier: Arc<crate::services::auth::AuthVerifier>,
}

impl PipelineStage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            match self.verifier.verify(&ctx.headers) {
                Ok(principal) => {
                    debug!("Authenticated {} via {:?}", principal.id, principal.method);
                    ctx.principal = Some(principal);
                    StageOutcome::Continue
                }
                Err(e) => StageOutcome::Fail(e),
            }
        }
        .boxed_local()
    }
}

/// Per-identity quota, checked once the principal is known.
pub struct QuotaStage {
    pub limiter: Arc<RateLimiter>,
}

impl PipelineStage for QuotaStage {
    fn name(&self) -> &'static str {
        "quota"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let Some(principal) = ctx.principal.as_ref() else {
                return StageOutcome::Continue;
            };
            let decision = self.limiter.check_identity(principal);
            // Identity state supersedes the global one for header decoration.
            ctx.records.quota = Some(decision.state);
            if !decision.allowed {
                return StageOutcome::Fail(GatewayError::RateLimited {
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "identity quota exhausted".to_string()),
                    limit: decision.state.limit,
                    reset_secs: decision.state.reset_secs,
                });
            }
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Cache lookup; a hit is a terminal response.
pub struct CacheLookupStage {
    pub cache: Arc<ResponseCache>,
}

impl PipelineStage for CacheLookupStage {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            // A credential the verifier consumed no longer disqualifies the
            // request from caching; opaque credentials (cookies, unverified
            // keys) still do.
            let mut effective_headers = ctx.headers.clone();
            if let Some(principal) = &ctx.principal {
                match principal.method {
                    crate::models::principal::AuthMethod::Jwt
                    | crate::models::principal::AuthMethod::Basic => {
                        effective_headers.remove("authorization");
                    }
                    crate::models::principal::AuthMethod::ApiKey => {
                        effective_headers.remove("x-api-key");
                    }
                }
            }
            if !self.cache.is_request_cacheable(&ctx.method, &effective_headers) {
                ctx.records.cache = Some(CacheDecision::Bypass);
                return StageOutcome::Continue;
            }

            let key = self
                .cache
                .cache_key(&ctx.method, &ctx.path, &ctx.query, &ctx.headers);

            if let Some(entry) = self.cache.get(&key).await {
                debug!("Cache hit for {}", ctx.path);
                ctx.records.cache = Some(CacheDecision::Hit);
                let mut response = GatewayResponse::new(
                    actix_web::http::StatusCode::from_u16(entry.status)
                        .unwrap_or(actix_web::http::StatusCode::OK),
                );
                for (name, value) in &entry.headers {
                    response.set_header(name, value.clone());
                }
                response.body = entry.body();
                response.set_header("x-cache", "HIT");
                response.set_header("x-cache-key", key.clone());
                ctx.records.cache_key = Some(key);
                return StageOutcome::Terminal(response);
            }

            ctx.records.cache = Some(CacheDecision::Miss);
            ctx.records.cache_key = Some(key);
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Circuit breaker admission gate.
pub struct CircuitGateStage {
    pub circuits: Arc<CircuitBreakerRegistry>,
}

impl PipelineStage for CircuitGateStage {
    fn name(&self) -> &'static str {
        "circuit_gate"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let service_header = ctx.header("x-service-name").map(String::from);
            let Some(key) =
                CircuitBreakerRegistry::service_key(&ctx.path, service_header.as_deref())
            else {
                // No service identity to account against; bypass the breaker.
                return StageOutcome::Continue;
            };

            let breaker = self.circuits.breaker_for(&key);
            ctx.records.circuit_state = Some(breaker.state().as_str().to_string());
            match breaker.try_acquire() {
                Ok(permit) => {
                    ctx.circuit_permit = Some(permit);
                    ctx.circuit_service = Some(key);
                    StageOutcome::Continue
                }
                Err(rejection) => StageOutcome::Fail(GatewayError::CircuitOpen {
                    service: key,
                    retry_after_secs: rejection.retry_after_secs(),
                }),
            }
        }
        .boxed_local()
    }
}

/// Service resolution and instance selection.
pub struct RoutingStage {
    pub settings: Arc<Settings>,
    pub health: Arc<HealthRegistry>,
    pub balancers: Arc<HashMap<String, Arc<dyn LoadBalancer>>>,
}

impl PipelineStage for RoutingStage {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let Some(service) = self.settings.service_for_path(&ctx.path) else {
                return StageOutcome::Fail(GatewayError::NotFound {
                    path: ctx.path.clone(),
                });
            };

            let healthy = self.health.healthy_instances(service);
            if healthy.is_empty() {
                return StageOutcome::Fail(GatewayError::NoHealthyInstance {
                    service: service.name.clone(),
                });
            }

            let balancer = self.balancers.get(&service.name);
            let instance = match balancer {
                Some(balancer) => balancer.select(&healthy, Some(&ctx.client_ip)),
                None => healthy.first().cloned(),
            };
            let Some(instance) = instance else {
                return StageOutcome::Fail(GatewayError::NoHealthyInstance {
                    service: service.name.clone(),
                });
            };

            if let Some(balancer) = balancer {
                balancer.on_dispatch(&instance);
            }
            debug!("Routed {} to {}", ctx.path, instance.key());
            ctx.service = Some(service.name.clone());
            ctx.instance = Some(instance.key());
            ctx.selected_service = Some(service.clone());
            ctx.selected_instance = Some(instance);
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Upstream forwarding with outcome reporting to the breaker, health table,
/// and connection counters.
pub struct ProxyStage {
    pub proxy: Arc<ReverseProxy>,
    pub health: Arc<HealthRegistry>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub balancers: Arc<HashMap<String, Arc<dyn LoadBalancer>>>,
}

impl PipelineStage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let (Some(service), Some(instance)) =
                (ctx.selected_service.clone(), ctx.selected_instance.clone())
            else {
                return StageOutcome::Fail(GatewayError::Internal {
                    message: "proxy stage reached without a routing decision".to_string(),
                });
            };

            // The breaker's call timeout governs when a circuit is engaged;
            // otherwise the service timeout applies directly.
            let timeout = match ctx.circuit_service.as_deref() {
                Some(key) => self.circuits.breaker_for(key).call_timeout(),
                None => Duration::from_secs(service.timeout_secs),
            };

            let result = self
                .proxy
                .forward(
                    &service,
                    &instance,
                    &ctx.method,
                    &ctx.path,
                    &ctx.query,
                    &ctx.headers,
                    ctx.body.clone(),
                    timeout,
                )
                .await;

            if let Some(balancer) = self.balancers.get(&service.name) {
                balancer.on_complete(&instance);
            }

            let permit = ctx.circuit_permit.take();
            let circuit_key = ctx.circuit_service.clone();

            match result {
                Ok(response) => {
                    let upstream_error = response.status.as_u16() >= 500;
                    if let (Some(permit), Some(key)) = (permit, circuit_key) {
                        let breaker = self.circuits.breaker_for(&key);
                        if upstream_error {
                            breaker.record_failure(permit, false);
                        } else {
                            breaker.record_success(permit);
                        }
                    }
                    self.health.record_success(&service.name, &instance.key());
                    ctx.response = Some(response);
                    StageOutcome::Continue
                }
                Err(e) => {
                    let timed_out = matches!(e, GatewayError::UpstreamTimeout { .. });
                    if let (Some(permit), Some(key)) = (permit, circuit_key) {
                        self.circuits
                            .breaker_for(&key)
                            .record_failure(permit, timed_out);
                    }
                    self.health.record_failure(&service.name, &instance.key());
                    StageOutcome::Fail(e)
                }
            }
        }
        .boxed_local()
    }
}

/// Response-side rules, the gateway envelope, cache store, and invalidation.
pub struct ResponseTransformStage {
    pub transformer: Arc<Transformer>,
    pub cache: Arc<ResponseCache>,
}

impl PipelineStage for ResponseTransformStage {
    fn name(&self) -> &'static str {
        "response_transform"
    }

    fn run<'a>(&'a self, ctx: &'a mut RequestContext) -> LocalBoxFuture<'a, StageOutcome> {
        async move {
            let Some(mut response) = ctx.response.take() else {
                return StageOutcome::Fail(GatewayError::Internal {
                    message: "response transform reached without an upstream response".to_string(),
                });
            };

            self.transformer.apply_response(&ctx.path, &mut response);
            self.transformer.attach_gateway_envelope(
                &mut response,
                &ctx.request_id,
                ctx.service.as_deref(),
                ctx.instance.as_deref(),
            );

            // Store after the envelope is attached so replayed hits are
            // byte-identical to the first response.
            if ctx.records.cache == Some(CacheDecision::Miss) {
                if let Some(key) = ctx.records.cache_key.clone() {
                    if self.cache.is_response_cacheable(
                        response.status.as_u16(),
                        &response.headers,
                        &response.body,
                    ) {
                        let ttl = self.cache.ttl_for(&ctx.path, &response.headers);
                        let entry = CacheEntry::from_response(
                            response.status.as_u16(),
                            &response.headers,
                            &response.body,
                        );
                        self.cache.set(&key, entry, ttl).await;
                        response.set_header("x-cache-key", key);
                    }
                }
            }
            if ctx.records.cache == Some(CacheDecision::Miss)
                && response.header("x-cache").is_none()
            {
                response.set_header("x-cache", "MISS");
            }

            // Keyed invalidation is best-effort and happens off the request
            // path once the invalidator has succeeded.
            if response.status.as_u16() < 400 {
                if let Some(prefix) = self
                    .cache
                    .invalidation_prefix(&ctx.method, &ctx.path)
                    .map(String::from)
                {
                    let cache = self.cache.clone();
                    tokio::spawn(async move {
                        cache.invalidate_prefix(&prefix).await;
                    });
                }
            }

            ctx.response = Some(response);
            StageOutcome::Continue
        }
        .boxed_local()
    }
}

/// Builds the per-service balancer table at startup.
pub fn build_balancers(settings: &Settings) -> HashMap<String, Arc<dyn LoadBalancer>> {
    settings
        .routing
        .services
        .iter()
        .map(|service| {
            (
                service.name.clone(),
                crate::services::load_balancer::LoadBalancerFactory::create(
                    service.load_balancing,
                ),
            )
        })
        .collect()
}
