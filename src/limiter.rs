use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    clock::{Clock, SystemClock},
    config::RateLimitConfig,
    key::KeyExtractor,
    window::{Decision, WindowStore},
};

/// Sliding-window admission control for inbound requests.
///
/// One instance is constructed at startup, handed to the router, and shared
/// by every request through the middleware. Cloning shares the underlying
/// store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<WindowStore>,
    clock: Arc<dyn Clock>,
    extractor: KeyExtractor,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Constructs a limiter with an injected clock. Misconfiguration is the
    /// only failure mode and surfaces before the server accepts traffic.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        if config.window_ms <= 0 {
            anyhow::bail!("RATE_LIMIT_WINDOW_MS must be greater than zero");
        }
        if config.max_requests == 0 {
            anyhow::bail!("RATE_LIMIT_MAX_REQUESTS must be greater than zero");
        }

        Ok(Self {
            store: Arc::new(WindowStore::new(config.window_ms, config.max_requests)),
            clock,
            extractor: KeyExtractor::new(config.trust_proxy),
        })
    }

    pub fn check(&self, client_key: &str) -> Decision {
        self.store.try_admit(client_key, self.clock.now_ms())
    }

    pub fn client_key(&self, req: &Request<Body>) -> String {
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        self.extractor.extract(req.headers(), remote)
    }

    /// Reclaims logs for keys with no recent traffic. Driven by the interval
    /// task in `main`.
    pub fn sweep(&self) -> usize {
        self.store.sweep(self.clock.now_ms())
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.tracked_keys()
    }
}

pub async fn rate_limit_middleware(
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let rate_limiter = req
        .extensions()
        .get::<RateLimiter>()
        .cloned()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let client_key = rate_limiter.client_key(&req);
    let decision = rate_limiter.check(&client_key);

    if !decision.admitted {
        tracing::warn!("Rate limit exceeded for client: {}", client_key);
        return Ok(rejection_response(&decision));
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// Sets `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// (epoch seconds) on a response.
fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(decision.reset_at_ms / 1_000),
    );
}

fn rejection_response(decision: &Decision) -> Response {
    let retry_after_secs = decision
        .retry_after_ms
        .map(|ms| (ms + 999) / 1_000)
        .unwrap_or(0);

    let body = Json(json!({
        "success": false,
        "message": "Too many requests",
        "data": {
            "limit": decision.limit,
            "remaining": decision.remaining,
            "retryAfterSeconds": retry_after_secs,
        }
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));

    response
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::clock::testing::ManualClock;

    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default_limits()
    }

    fn limiter_at(start_ms: i64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let limiter = RateLimiter::with_clock(&config(), clock.clone()).unwrap();
        (limiter, clock)
    }

    #[test]
    fn rejects_non_positive_window() {
        let mut config = config();
        config.window_ms = 0;

        assert!(RateLimiter::new(&config).is_err());
    }

    #[test]
    fn rejects_zero_max_requests() {
        let mut config = config();
        config.max_requests = 0;

        assert!(RateLimiter::new(&config).is_err());
    }

    #[test]
    fn enforces_the_window_through_the_clock() {
        let (limiter, clock) = limiter_at(0);

        for i in 0..10 {
            let decision = limiter.check("1.2.3.4");
            assert!(decision.admitted);
            assert_eq!(decision.remaining, 9 - i);
            clock.advance(10);
        }

        clock.set(150);
        let rejected = limiter.check("1.2.3.4");
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after_ms, Some(4_850));

        clock.set(5_100);
        let recovered = limiter.check("1.2.3.4");
        assert!(recovered.admitted);
        assert_eq!(recovered.remaining, 9);
    }

    #[test]
    fn sweep_runs_against_the_injected_clock() {
        let (limiter, clock) = limiter_at(0);

        limiter.check("a");
        assert_eq!(limiter.tracked_keys(), 1);

        clock.set(9_999);
        assert_eq!(limiter.sweep(), 0);

        clock.set(10_000);
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn client_key_prefers_proxy_headers() {
        let (limiter, _clock) = limiter_at(0);

        let req = Request::builder()
            .uri("/health")
            .header("x-forwarded-for", "5.6.7.8, 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(limiter.client_key(&req), "5.6.7.8");
    }

    #[test]
    fn client_key_uses_connect_info_without_headers() {
        let (limiter, _clock) = limiter_at(0);

        let mut req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = "10.0.0.7:41234".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));

        assert_eq!(limiter.client_key(&req), "10.0.0.7");
    }

    #[test]
    fn headers_are_applied_on_admission() {
        let decision = Decision {
            admitted: true,
            limit: 10,
            remaining: 7,
            reset_at_ms: 42_000,
            retry_after_ms: None,
        };

        let mut headers = HeaderMap::new();
        apply_rate_limit_headers(&mut headers, &decision);

        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "7");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "42");
    }

    #[tokio::test]
    async fn rejection_carries_status_headers_and_envelope() {
        let decision = Decision {
            admitted: false,
            limit: 10,
            remaining: 0,
            reset_at_ms: 5_000,
            retry_after_ms: Some(4_850),
        };

        let response = rejection_response(&decision);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(response.headers().get("x-ratelimit-reset").unwrap(), "5");
        // 4850ms rounds up to the next whole second.
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "5");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Too many requests");
        assert_eq!(body["data"]["limit"], 10);
        assert_eq!(body["data"]["remaining"], 0);
        assert_eq!(body["data"]["retryAfterSeconds"], 5);
    }
}
