//! Small request helpers shared by the route handlers.

use actix_web::HttpRequest;
use std::collections::HashMap;

/// Collects request headers into a lowercase-keyed map. Values that are not
/// valid UTF-8 are skipped.
pub fn header_map(req: &HttpRequest) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

/// Client IP as seen through proxies, falling back to the peer address.
pub fn client_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .map(|addr| addr.split(':').next().unwrap_or(addr).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses the raw query string into a map. Repeated keys keep the last value.
pub fn query_map(query_string: &str) -> HashMap<String, String> {
    query_string
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_map() {
        let parsed = query_map("a=1&b=2&flag");
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "2");
        assert_eq!(parsed["flag"], "");
        assert!(query_map("").is_empty());
    }
}
