use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::HOST, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics::Metrics;
use crate::ratelimit::{RateLimitDecision, RateLimitStore};

pub const HEALTH_CHECK_PATH: &str = "/healthcheck";

#[derive(Clone)]
pub struct RateLimitState {
    store: Arc<RateLimitStore>,
    excluded_paths: Arc<Vec<String>>,
    metrics: Arc<Metrics>,
}

impl RateLimitState {
    /// The health-check path is always exempt, whatever `excluded_paths` says.
    pub fn new(store: Arc<RateLimitStore>, metrics: Arc<Metrics>) -> Self {
        let mut excluded_paths = store.config().excluded_paths.clone();
        if !excluded_paths.iter().any(|p| p == HEALTH_CHECK_PATH) {
            excluded_paths.push(HEALTH_CHECK_PATH.to_string());
        }
        Self {
            store,
            excluded_paths: Arc::new(excluded_paths),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    /// Exact match, or prefix match on a path-segment boundary.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .map_or(false, |rest| prefix.ends_with('/') || rest.starts_with('/'))
        })
    }
}

/// Resolves the rate-limiting key for a request.
///
/// Precedence: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the peer
/// address, then `"unknown"`. Unreadable or empty headers fall through.
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Accepted `Host` names: exact (case-insensitive), `*`, or `*.domain` for subdomains.
#[derive(Clone)]
pub struct TrustedHosts {
    patterns: Arc<Vec<String>>,
}

impl TrustedHosts {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: Arc::new(patterns.into_iter().map(|p| p.to_ascii_lowercase()).collect()),
        }
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.patterns.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            match pattern.strip_prefix("*.") {
                Some(domain) => host
                    .strip_suffix(domain)
                    .map_or(false, |rest| rest.ends_with('.')),
                None => *pattern == host,
            }
        })
    }
}

/// Host name with any port removed; bracketed IPv6 literals keep their brackets.
fn host_name(raw: &str) -> &str {
    if raw.starts_with('[') {
        raw.split_inclusive(']').next().unwrap_or(raw)
    } else {
        raw.split(':').next().unwrap_or(raw)
    }
}

pub async fn trusted_host(State(hosts): State<TrustedHosts>, req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(host_name)
        .unwrap_or("");
    if !hosts.allows(host) {
        warn!(host = %host, path = %req.uri().path(), "Rejected untrusted host");
        return AppError::BadRequest("Invalid host header".into()).into_response();
    }
    next.run(req).await
}

pub async fn rate_limit(State(state): State<RateLimitState>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if state.is_excluded(path) {
        return next.run(req).await;
    }

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_id(req.headers(), peer);
    let decision = state.store.is_allowed(&client);

    if let Some(denial) = &decision.denial {
        state.metrics.inc_rate_limited();
        warn!(
            client = %client,
            path = %path,
            window = %denial.window,
            retry_after = denial.retry_after,
            "Rate limit exceeded"
        );
        return AppError::RateLimited(decision).into_response();
    }

    debug!(client = %client, remaining_minute = decision.remaining_minute, "Request admitted");
    let mut response = next.run(req).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use axum::{body::Body, http::StatusCode, middleware::from_fn_with_state, routing::get, Router};
    use std::net::{IpAddr, Ipv4Addr};
    use tower::ServiceExt;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000))
    }

    #[test]
    fn client_id_prefers_forwarded_for() {
        let h = headers(&[("x-forwarded-for", "192.168.1.1, 10.0.0.1"), ("x-real-ip", "192.168.1.9")]);
        assert_eq!(client_id(&h, peer()), "192.168.1.1");
    }

    #[test]
    fn client_id_uses_real_ip() {
        let h = headers(&[("x-real-ip", "192.168.1.2")]);
        assert_eq!(client_id(&h, peer()), "192.168.1.2");
    }

    #[test]
    fn client_id_falls_back_to_peer_then_unknown() {
        assert_eq!(client_id(&HeaderMap::new(), peer()), "127.0.0.1");
        assert_eq!(client_id(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn client_id_skips_blank_forwarded_for() {
        let h = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "192.168.1.3")]);
        assert_eq!(client_id(&h, None), "192.168.1.3");
    }

    #[test]
    fn trusted_host_patterns() {
        let hosts = TrustedHosts::new(vec!["api.snaprate.io".into(), "*.Example.com".into()]);
        assert!(hosts.allows("api.snaprate.io"));
        assert!(hosts.allows("API.SnapRate.io"));
        assert!(hosts.allows("shop.example.com"));
        assert!(!hosts.allows("example.com"));
        assert!(!hosts.allows("badexample.com"));
        assert!(!hosts.allows("evil.io"));
        assert!(!hosts.allows(""));
        assert!(TrustedHosts::new(vec!["*".into()]).allows("anything.at.all"));
    }

    #[test]
    fn host_name_drops_port() {
        assert_eq!(host_name("localhost:8000"), "localhost");
        assert_eq!(host_name("[::1]:8000"), "[::1]");
        assert_eq!(host_name("snaprate.io"), "snaprate.io");
    }

    #[tokio::test]
    async fn untrusted_host_is_rejected() {
        let app = Router::new()
            .route("/test", get(|| async { "success" }))
            .layer(from_fn_with_state(
                TrustedHosts::new(vec!["localhost".into()]),
                trusted_host,
            ));

        let request = |host: &str| {
            axum::http::Request::builder()
                .uri("/test")
                .header("host", host)
                .body(Body::empty())
                .unwrap()
        };

        let resp = app.clone().oneshot(request("localhost:8000")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(request("evil.io")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "Invalid host header");
    }

    fn limited_app(config: RateLimitConfig) -> (Router, RateLimitState) {
        let store = Arc::new(RateLimitStore::new(config));
        let state = RateLimitState::new(store, Arc::new(Metrics::new()));
        let app = Router::new()
            .route("/test", get(|| async { "success" }))
            .route("/healthcheck", get(|| async { "healthy" }))
            .route("/docs/index", get(|| async { "docs" }))
            .layer(from_fn_with_state(state.clone(), rate_limit));
        (app, state)
    }

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: 3,
            requests_per_hour: 10,
            burst_limit: 2,
            cleanup_interval: 60,
            excluded_paths: vec!["/docs".to_string()],
            ..RateLimitConfig::default()
        }
    }

    fn get_from(path: &str, client: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(path)
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn exclusion_matches_on_segment_boundary() {
        let (_, state) = limited_app(test_config());
        assert!(state.is_excluded("/healthcheck"));
        assert!(state.is_excluded("/docs"));
        assert!(state.is_excluded("/docs/index"));
        assert!(!state.is_excluded("/docsearch"));
        assert!(!state.is_excluded("/test"));
    }

    #[tokio::test]
    async fn excluded_paths_are_never_limited() {
        let (app, state) = limited_app(test_config());

        for _ in 0..20 {
            let resp = app.clone().oneshot(get_from("/healthcheck", "1.1.1.1")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(resp.headers().get("x-ratelimit-remaining-minute").is_none());
        }
        assert_eq!(state.store().client_count(), 0);
    }

    #[tokio::test]
    async fn limits_regular_routes() {
        let (app, _) = limited_app(test_config());

        for _ in 0..2 {
            let resp = app.clone().oneshot(get_from("/test", "2.2.2.2")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(resp.headers().contains_key("x-ratelimit-remaining-minute"));
            assert!(resp.headers().contains_key("x-ratelimit-remaining-hour"));
        }

        let resp = app.clone().oneshot(get_from("/test", "2.2.2.2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-ratelimit-window"], "burst");
        assert_eq!(resp.headers()["x-ratelimit-limit"], "2");
        assert!(resp.headers().contains_key("retry-after"));

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status_code"], 429);
        assert_eq!(body["message"], "Rate limit exceeded");
        assert!(body["details"]["retry_after"].is_u64());

        let other = app.oneshot(get_from("/test", "3.3.3.3")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
        assert_eq!(other.headers()["x-ratelimit-remaining-minute"], "2");
    }
}
