//! Per-request context threaded through the pipeline.
//!
//! The orchestrator owns exactly one [`RequestContext`] per request; each
//! stage receives it by mutable reference for the duration of its call.
//! Stages communicate through typed fields rather than a dynamic bag, so a
//! stage can only observe what an earlier stage has explicitly published.

use crate::models::principal::Principal;
use crate::models::service::{ServiceDescriptor, ServiceInstance};
use crate::services::circuit_breaker::CircuitPermit;
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

/// An HTTP response held as plain data.
///
/// Stages build and mutate responses in this form; only the orchestrator
/// converts the final value into a framework response when emitting.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    /// Header pairs in insertion order. Names are kept lowercase.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Sets a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
    }

    /// Builds a JSON response in one step.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        GatewayResponse::new(status)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }
}

/// Cache decision sampled during the cache-lookup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Hit,
    Miss,
    /// Request was not eligible for caching at all.
    Bypass,
}

/// Quota state recorded by the rate limiter for response decoration.
#[derive(Debug, Clone, Copy)]
pub struct QuotaState {
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
}

/// Decision records accumulated while the request moves through the stages.
///
/// These exist for observability: hooks, logs, and the monitoring sink read
/// them after the fact.
#[derive(Debug, Clone, Default)]
pub struct StageRecords {
    pub cache: Option<CacheDecision>,
    /// Key computed during cache lookup, reused by the store step.
    pub cache_key: Option<String>,
    pub quota: Option<QuotaState>,
    /// Circuit state name sampled when the breaker gate ran.
    pub circuit_state: Option<String>,
    /// Stage name -> elapsed microseconds.
    pub timings: Vec<(&'static str, u128)>,
    /// Error kind when the pipeline terminated with a failure.
    pub error_kind: Option<&'static str>,
}

/// Mutable request state owned by the pipeline orchestrator.
pub struct RequestContext {
    /// Unique id assigned at ingress, echoed as `X-Request-Id`.
    pub request_id: String,
    /// Monotonic start used for response-time measurement.
    pub started: Instant,
    /// Wall-clock start used in envelopes and logs.
    pub started_at: DateTime<Utc>,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Request headers, lowercase names.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Parsed JSON body when the content type is JSON and parsing succeeds.
    pub body_json: Option<serde_json::Value>,

    /// Service selected by the router.
    pub service: Option<String>,
    /// Instance endpoint (`host:port`) selected by the load balancer.
    pub instance: Option<String>,
    /// Typed routing result consumed by the proxy stage.
    pub selected_service: Option<ServiceDescriptor>,
    pub selected_instance: Option<ServiceInstance>,
    /// Circuit admission for this request, handed back after the proxy call.
    pub circuit_permit: Option<CircuitPermit>,
    /// Circuit key the permit was acquired under.
    pub circuit_service: Option<String>,
    pub principal: Option<Principal>,

    /// The response to emit. Populated either by a terminal stage or by the
    /// proxy; later mutating stages are skipped once `terminal` is set.
    pub response: Option<GatewayResponse>,
    /// True when a stage short-circuited the pipeline.
    pub terminal: bool,

    pub records: StageRecords,
}

impl RequestContext {
    pub fn new(
        client_ip: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            client_ip: client_ip.into(),
            method: method.into(),
            path: path.into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
            body_json: None,
            service: None,
            instance: None,
            selected_service: None,
            selected_instance: None,
            circuit_permit: None,
            circuit_service: None,
            principal: None,
            response: None,
            terminal: false,
            records: StageRecords::default(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Marks the pipeline as terminated with the given response.
    pub fn terminate(&mut self, response: GatewayResponse) {
        self.response = Some(response);
        self.terminal = true;
    }

    /// Milliseconds elapsed since the request entered the gateway.
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    pub fn record_timing(&mut self, stage: &'static str, elapsed_us: u128) {
        self.records.timings.push((stage, elapsed_us));
    }

    /// Re-parses the body as JSON after a mutation, keeping `body` and
    /// `body_json` consistent.
    pub fn sync_body_from_json(&mut self) {
        if let Some(json) = &self.body_json {
            self.body = Bytes::from(json.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_unique() {
        let a = RequestContext::new("127.0.0.1", "GET", "/api/users");
        let b = RequestContext::new("127.0.0.1", "GET", "/api/users");
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.request_id.len(), 36);
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/");
        ctx.set_header("X-Service-Name", "users");
        assert_eq!(ctx.header("x-service-name"), Some("users"));
        assert_eq!(ctx.header("X-SERVICE-NAME"), Some("users"));
    }

    #[test]
    fn test_terminate_sets_response() {
        let mut ctx = RequestContext::new("127.0.0.1", "GET", "/");
        assert!(!ctx.terminal);
        ctx.terminate(GatewayResponse::new(StatusCode::TOO_MANY_REQUESTS));
        assert!(ctx.terminal);
        assert_eq!(
            ctx.response.as_ref().unwrap().status,
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_response_header_replacement() {
        let mut resp = GatewayResponse::new(StatusCode::OK);
        resp.set_header("X-Cache", "MISS");
        resp.set_header("X-Cache", "HIT");
        assert_eq!(resp.header("x-cache"), Some("HIT"));
        assert_eq!(resp.headers.len(), 1);
    }

    #[test]
    fn test_body_json_sync() {
        let mut ctx = RequestContext::new("127.0.0.1", "POST", "/api/users");
        ctx.body_json = Some(serde_json::json!({"name": "alice"}));
        ctx.sync_body_from_json();
        assert_eq!(ctx.body.as_ref(), br#"{"name":"alice"}"#);
    }
}
