//! Upstream request forwarding.
//!
//! The proxy owns a pooled HTTP client shared by every worker. It rewrites
//! the path according to the service's strip-prefix setting, filters
//! hop-by-hop headers in both directions, enforces the caller-supplied
//! timeout, and stamps the selected service and instance onto the response.

use crate::models::context::GatewayResponse;
use crate::models::error::GatewayError;
use crate::models::service::{ServiceDescriptor, ServiceInstance};
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;

/// Headers never forwarded upstream. `host` is regenerated from the target
/// URL and the rest are connection-scoped.
const SKIP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// Headers never replayed from the upstream response.
const SKIP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "keep-alive"];

pub struct ReverseProxy {
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .build()
            .expect("Failed to create proxy HTTP client");
        Self { client }
    }

    /// Forwards one request to the selected instance and buffers the reply.
    ///
    /// # Errors
    ///
    /// * `UpstreamTimeout` - the call exceeded `timeout`
    /// * `BadGateway` - connect or transport failure
    pub async fn forward(
        &self,
        service: &ServiceDescriptor,
        instance: &ServiceInstance,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let url = build_upstream_url(service, instance, path, query)?;

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        debug!("Forwarding {} {} -> {}", method, path, url);

        let request = self
            .client
            .request(method, url.clone())
            .headers(build_request_headers(headers))
            .body(body.to_vec());

        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Upstream call to {} failed: {}", url, e);
                return Err(GatewayError::BadGateway {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!("Upstream call to {} timed out after {:?}", url, timeout);
                return Err(GatewayError::UpstreamTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut out = GatewayResponse::new(status);
        for (name, value) in response.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_RESPONSE_HEADERS.contains(&lowered.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                out.headers.push((lowered, value.to_string()));
            }
        }
        out.set_header("x-gateway-service", &service.name);
        out.set_header("x-gateway-instance", instance.key());

        // Reading the body can still hit the wire; treat failures there the
        // same as transport failures.
        out.body = response.bytes().await.map_err(|e| GatewayError::BadGateway {
            message: e.to_string(),
        })?;

        Ok(out)
    }
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuilds the upstream URL with the (possibly transformed) query map.
/// Pairs are percent-encoded, so rule-injected values containing `&`, `=`,
/// or spaces stay literal characters instead of becoming parameter
/// boundaries. Pairs are appended in sorted order for stable URLs.
fn build_upstream_url(
    service: &ServiceDescriptor,
    instance: &ServiceInstance,
    path: &str,
    query: &HashMap<String, String>,
) -> Result<reqwest::Url, GatewayError> {
    let upstream_path = service.upstream_path(path);
    let mut url = reqwest::Url::parse(&format!("{}{}", instance.url(), upstream_path))
        .map_err(|e| GatewayError::BadGateway {
            message: format!("invalid upstream url for {}: {}", instance.key(), e),
        })?;

    if !query.is_empty() {
        let mut pairs: Vec<(&String, &String)> = query.iter().collect();
        pairs.sort();
        let mut serializer = url.query_pairs_mut();
        for (name, value) in pairs {
            serializer.append_pair(name, value);
        }
        drop(serializer);
    }

    Ok(url)
}

fn build_request_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if SKIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map.entry("user-agent")
        .or_insert_with(|| HeaderValue::from_static(concat!("pylon-rs/", env!("CARGO_PKG_VERSION"))));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_service() -> ServiceDescriptor {
        ServiceDescriptor {
            name: "users".into(),
            path_prefix: "/api/users".into(),
            strip_prefix: true,
            instances: vec![],
            load_balancing: Default::default(),
            timeout_secs: 1,
            health_check: Default::default(),
            circuit_breaker: None,
        }
    }

    fn backend(host: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    #[test]
    fn test_upstream_url_without_query() {
        let url = build_upstream_url(
            &users_service(),
            &backend("http://backend.internal", 8080),
            "/api/users/1",
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://backend.internal:8080/1");
        assert!(url.query().is_none());
    }

    #[test]
    fn test_upstream_url_percent_encodes_query_values() {
        let mut query = HashMap::new();
        query.insert("q".to_string(), "a&b=c d".to_string());
        let url = build_upstream_url(
            &users_service(),
            &backend("http://backend.internal", 8080),
            "/api/users/1",
            &query,
        )
        .unwrap();

        // No spurious parameter boundaries leaked into the query string.
        assert_eq!(url.as_str(), "http://backend.internal:8080/1?q=a%26b%3Dc+d");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs, vec![("q".to_string(), "a&b=c d".to_string())]);
    }

    #[test]
    fn test_upstream_url_query_pairs_sorted() {
        let mut query = HashMap::new();
        query.insert("b".to_string(), "2".to_string());
        query.insert("a".to_string(), "1".to_string());
        let url = build_upstream_url(
            &users_service(),
            &backend("http://backend.internal", 8080),
            "/api/users",
            &query,
        )
        .unwrap();
        assert_eq!(url.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_request_header_filtering() {
        let mut headers = HashMap::new();
        headers.insert("host".to_string(), "gateway.local".to_string());
        headers.insert("connection".to_string(), "keep-alive".to_string());
        headers.insert("content-length".to_string(), "42".to_string());
        headers.insert("accept".to_string(), "application/json".to_string());
        headers.insert("x-custom".to_string(), "yes".to_string());

        let built = build_request_headers(&headers);
        assert!(built.get("host").is_none());
        assert!(built.get("connection").is_none());
        assert!(built.get("content-length").is_none());
        assert_eq!(built.get("accept").unwrap(), "application/json");
        assert_eq!(built.get("x-custom").unwrap(), "yes");
        assert!(built.get("user-agent").is_some());
    }

    #[test]
    fn test_existing_user_agent_preserved() {
        let mut headers = HashMap::new();
        headers.insert("user-agent".to_string(), "client/1.0".to_string());
        let built = build_request_headers(&headers);
        assert_eq!(built.get("user-agent").unwrap(), "client/1.0");
    }

    #[tokio::test]
    async fn test_unreachable_instance_maps_to_bad_gateway() {
        let proxy = ReverseProxy::new();
        let service = ServiceDescriptor {
            name: "users".into(),
            path_prefix: "/api/users".into(),
            strip_prefix: true,
            instances: vec![],
            load_balancing: Default::default(),
            timeout_secs: 1,
            health_check: Default::default(),
            circuit_breaker: None,
        };
        // Reserved TEST-NET address; nothing listens there.
        let instance = ServiceInstance {
            host: "http://192.0.2.1".into(),
            port: 9,
            weight: 1,
        };

        let result = proxy
            .forward(
                &service,
                &instance,
                "GET",
                "/api/users/1",
                &HashMap::new(),
                &HashMap::new(),
                Bytes::new(),
                Duration::from_millis(300),
            )
            .await;

        match result {
            Err(GatewayError::BadGateway { .. }) | Err(GatewayError::UpstreamTimeout { .. }) => {}
            other => panic!("expected gateway error, got {:?}", other.map(|r| r.status)),
        }
    }
}
