//! The pipeline orchestrator.
//!
//! `Gateway::handle` owns the request context and threads it through the
//! fixed stage sequence, interleaving plugin hooks at their published
//! points. It guarantees that exactly one response is emitted, that hooks
//! fire even when a stage terminates the pipeline early, and that timing,
//! status, and error kind are recorded for every outcome. Error mapping is
//! centralized here; stages only fail with typed error kinds.

use crate::models::context::{GatewayResponse, RequestContext};
use crate::models::error::GatewayError;
use crate::models::settings::Settings;
use crate::pipeline::stage::{PipelineStage, StageOutcome};
use crate::pipeline::stages::{
    build_balancers, AuthStage, CacheLookupStage, CircuitGateStage, ProxyStage, QuotaStage,
    RateLimitStage, RequestTransformStage, ResponseTransformStage, RoutingStage, SecurityStage,
};
use crate::services::auth::AuthVerifier;
use crate::services::cache::ResponseCache;
use crate::services::circuit_breaker::CircuitBreakerRegistry;
use crate::services::health::HealthRegistry;
use crate::services::load_balancer::LoadBalancer;
use crate::services::monitor::GatewayMonitor;
use crate::services::plugins::{HookKind, PluginEngine};
use crate::services::proxy::ReverseProxy;
use crate::services::rate_limit::RateLimiter;
use crate::services::security::SecurityFilter;
use crate::services::transform::Transformer;
use actix_web::HttpResponse;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One slot in the pipeline: either a plugin hook point or a stage.
enum Slot {
    Hook(HookKind),
    Stage(Box<dyn PipelineStage>),
}

/// The assembled gateway: every stateful controller plus the stage sequence.
pub struct Gateway {
    pub settings: Arc<Settings>,
    pub verifier: Arc<AuthVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<ResponseCache>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub health: Arc<HealthRegistry>,
    pub balancers: Arc<HashMap<String, Arc<dyn LoadBalancer>>>,
    pub filter: Arc<SecurityFilter>,
    pub transformer: Arc<Transformer>,
    pub plugins: Arc<PluginEngine>,
    pub monitor: Arc<GatewayMonitor>,
    slots: Vec<Slot>,
}

impl Gateway {
    /// Assembles the gateway from its controllers and builds the stage
    /// sequence with hooks at their fixed points.
    pub fn new(
        settings: Arc<Settings>,
        verifier: Arc<AuthVerifier>,
        cache: Arc<ResponseCache>,
        plugins: Arc<PluginEngine>,
        monitor: Arc<GatewayMonitor>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit.clone()));
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            settings.circuit_breaker.clone(),
            settings
                .routing
                .services
                .iter()
                .filter_map(|s| {
                    s.circuit_breaker
                        .clone()
                        .map(|cb| (s.name.clone(), cb))
                })
                .collect(),
        ));
        let health = HealthRegistry::new(&settings.routing.services);
        let balancers = Arc::new(build_balancers(&settings));
        let filter = Arc::new(SecurityFilter::new(settings.security.clone()));
        let transformer = Arc::new(Transformer::new(settings.transformation.clone()));
        let proxy = Arc::new(ReverseProxy::new());

        let slots = vec![
            Slot::Hook(HookKind::BeforeRequest),
            Slot::Stage(Box::new(SecurityStage {
                filter: filter.clone(),
            })),
            Slot::Stage(Box::new(RateLimitStage {
                limiter: limiter.clone(),
            })),
            Slot::Stage(Box::new(RequestTransformStage {
                transformer: transformer.clone(),
            })),
            Slot::Hook(HookKind::BeforeAuth),
            Slot::Stage(Box::new(AuthStage {
                verifier: verifier.clone(),
            })),
            Slot::Hook(HookKind::AfterAuth),
            Slot::Stage(Box::new(QuotaStage {
                limiter: limiter.clone(),
            })),
            Slot::Hook(HookKind::BeforeCache),
            Slot::Stage(Box::new(CacheLookupStage {
                cache: cache.clone(),
            })),
            Slot::Hook(HookKind::AfterCache),
            Slot::Hook(HookKind::BeforeRouting),
            Slot::Stage(Box::new(CircuitGateStage {
                circuits: circuits.clone(),
            })),
            Slot::Stage(Box::new(RoutingStage {
                settings: settings.clone(),
                health: health.clone(),
                balancers: balancers.clone(),
            })),
            Slot::Hook(HookKind::AfterRouting),
            Slot::Stage(Box::new(ProxyStage {
                proxy,
                health: health.clone(),
                circuits: circuits.clone(),
                balancers: balancers.clone(),
            })),
            Slot::Hook(HookKind::BeforeResponse),
            Slot::Stage(Box::new(ResponseTransformStage {
                transformer: transformer.clone(),
                cache: cache.clone(),
            })),
            Slot::Hook(HookKind::AfterRequest),
        ];

        Self {
            settings,
            verifier,
            limiter,
            cache,
            circuits,
            health,
            balancers,
            filter,
            transformer,
            plugins,
            monitor,
            slots,
        }
    }

    /// Runs the full pipeline for one request and emits the response.
    pub async fn handle(&self, mut ctx: RequestContext) -> HttpResponse {
        self.monitor.increment_connections();
        info!(
            "{} {} {} [{}]",
            ctx.client_ip, ctx.method, ctx.path, ctx.request_id
        );

        for slot in &self.slots {
            match slot {
                Slot::Hook(kind) => {
                    // Hooks observe every request, terminated or not.
                    self.plugins.fire(*kind, &mut ctx);
                }
                Slot::Stage(stage) => {
                    if ctx.terminal {
                        continue;
                    }
                    let started = Instant::now();
                    let outcome = stage.run(&mut ctx).await;
                    ctx.record_timing(stage.name(), started.elapsed().as_micros());
                    match outcome {
                        StageOutcome::Continue => {}
                        StageOutcome::Terminal(response) => {
                            ctx.terminate(response);
                        }
                        StageOutcome::Fail(e) => {
                            self.fail(&mut ctx, e);
                        }
                    }
                }
            }
        }

        let response = self.emit(&mut ctx);
        self.plugins.fire(HookKind::AfterResponse, &mut ctx);

        let status = response.status().as_u16();
        self.monitor
            .record_request(&ctx.method, &ctx.path, status, ctx.started.elapsed());
        self.monitor.decrement_connections();
        info!(
            "{} {} -> {} in {}ms [{}]",
            ctx.method,
            ctx.path,
            status,
            ctx.elapsed_ms(),
            ctx.request_id
        );
        response
    }

    /// Centralized error mapping: records the kind, fires `onError`, and
    /// terminates the pipeline with the mapped response.
    fn fail(&self, ctx: &mut RequestContext, error: GatewayError) {
        ctx.records.error_kind = Some(error.kind());
        self.plugins.fire(HookKind::OnError, ctx);

        let production = self.settings.server.is_production();
        let mut response = GatewayResponse::json(
            error.status_code(),
            &error.to_body(&ctx.request_id, production),
        );
        if let Some(retry_after) = error.retry_after() {
            response.set_header("retry-after", retry_after.to_string());
        }
        ctx.terminate(response);
    }

    /// Builds the final framework response, injecting the gateway headers
    /// and the rate-limit decoration.
    fn emit(&self, ctx: &mut RequestContext) -> HttpResponse {
        let mut response = match ctx.response.take() {
            Some(response) => response,
            None => {
                // Every stage continued without producing anything; that is
                // a pipeline bug, surfaced as a 500.
                error!("Pipeline produced no response for {}", ctx.request_id);
                let e = GatewayError::Internal {
                    message: "pipeline produced no response".to_string(),
                };
                GatewayResponse::json(
                    e.status_code(),
                    &e.to_body(&ctx.request_id, self.settings.server.is_production()),
                )
            }
        };

        self.transformer
            .attach_error_envelope(&mut response, &ctx.request_id);

        response.set_header("x-gateway-version", env!("CARGO_PKG_VERSION"));
        response.set_header("x-request-id", ctx.request_id.clone());
        response.set_header("x-response-time", format!("{}ms", ctx.elapsed_ms()));
        if let Some(quota) = &ctx.records.quota {
            response.set_header("x-ratelimit-limit", quota.limit.to_string());
            response.set_header("x-ratelimit-remaining", quota.remaining.to_string());
            response.set_header("x-ratelimit-reset", quota.reset_secs.to_string());
        }

        let mut builder = HttpResponse::build(response.status);
        for (name, value) in &response.headers {
            // The framework recomputes the length of the (possibly
            // transformed) body.
            if name == "content-length" {
                continue;
            }
            builder.insert_header((name.as_str(), value.as_str()));
        }
        builder.body(response.body)
    }
}
