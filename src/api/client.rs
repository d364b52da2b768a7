use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::cache::{cache_key, RequestCache};
use super::error::ApiError;
use super::rate_limiter::{
    hint_duration, AdaptiveRateLimiter, RateLimiterStats, ServerQuotaSnapshot,
};
use super::retry::RetryConfig;
use super::transport::{HttpTransport, ReqwestTransport};
use super::types::{HttpMethod, HttpRequest, HttpResponse};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct RequestStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    rate_limit_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub rate_limit_errors: u64,
    pub cache_size: usize,
    pub rate_limiter: RateLimiterStats,
    pub server_quota: ServerQuotaSnapshot,
}

/// Request/response client for the market data API.
///
/// Each call runs: cache lookup → token acquisition → transport call under
/// a timeout → status classification, with the last three steps wrapped in
/// a bounded exponential-backoff retry for transient failures.
pub struct RequestClient {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<AdaptiveRateLimiter>,
    cache: RequestCache,
    stats: RequestStats,
    config: ClientConfig,
}

impl RequestClient {
    pub fn new(config: ClientConfig, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self::with_transport(config, limiter, Arc::new(ReqwestTransport::new()))
    }

    pub fn with_transport(
        config: ClientConfig,
        limiter: Arc<AdaptiveRateLimiter>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let cache = if config.cache_enabled {
            RequestCache::new(config.cache_ttl)
        } else {
            RequestCache::disabled()
        };

        tracing::info!("API client initialized: {}", config.base_url);

        Self {
            transport,
            limiter,
            cache,
            stats: RequestStats::default(),
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    /// GET `endpoint`, served from cache when `use_cache` and a fresh entry exists.
    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        use_cache: bool,
    ) -> Result<Value, ApiError> {
        let url = self.url(endpoint);
        let key = (use_cache && !self.cache.is_disabled()).then(|| cache_key(&url, params));

        if let Some(key) = &key {
            if let Some(hit) = self.cache.get(key).await {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
        }

        let request = HttpRequest::new(HttpMethod::Get, url).with_query(params);
        let value = self.execute_with_retry(request).await?;

        if let Some(key) = key {
            self.cache.set(key, value.clone()).await;
        }

        Ok(value)
    }

    /// GET and deserialize into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let value = self.get(endpoint, params, true).await?;
        serde_json::from_value(value).map_err(|e| ApiError::Api {
            status: None,
            body: None,
            message: format!("Failed to decode response from {}: {}", endpoint, e),
        })
    }

    /// POST `body` to `endpoint`. Never cached.
    pub async fn post(
        &self,
        endpoint: &str,
        body: Option<Value>,
        params: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let mut request = HttpRequest::new(HttpMethod::Post, self.url(endpoint)).with_query(params);
        if let Some(body) = body {
            request = request.with_json(body);
        }
        self.execute_with_retry(request).await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }

    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            total_requests: self.stats.total.load(Ordering::Relaxed),
            successful_requests: self.stats.successful.load(Ordering::Relaxed),
            failed_requests: self.stats.failed.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            rate_limit_errors: self.stats.rate_limit_errors.load(Ordering::Relaxed),
            cache_size: self.cache.len().await,
            rate_limiter: self.limiter.stats(),
            server_quota: self.limiter.server_quota(),
        }
    }

    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            "📊 API Client Stats: total={} ok={} failed={} cache_hits={} rate_limited={} cache_size={} | {}",
            stats.total_requests,
            stats.successful_requests,
            stats.failed_requests,
            stats.cache_hits,
            stats.rate_limit_errors,
            stats.cache_size,
            stats.rate_limiter.format_status()
        );
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    async fn execute_with_retry(&self, request: HttpRequest) -> Result<Value, ApiError> {
        let request = request
            .with_bearer(&self.config.api_key)
            .with_header("content-type", "application/json")
            .with_timeout(self.config.request_timeout);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.send_once(request.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        "⏳ {} {} failed ({}), retrying in {:?} (attempt {}/{})",
                        request.method.as_str(),
                        request.url,
                        err,
                        delay,
                        attempt + 1,
                        max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, request: HttpRequest) -> Result<Value, ApiError> {
        self.limiter.acquire(1).await;
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let url = request.url.clone();
        let timeout = request.timeout;
        tracing::debug!("{} {}", request.method.as_str(), url);

        let response = match tokio::time::timeout(timeout, self.transport.execute(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Request failed: {}", e);
                return Err(ApiError::transport(e.to_string()));
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Request to {} timed out after {:?}", url, timeout);
                return Err(ApiError::transport(format!("timed out after {:?}", timeout)));
            }
        };

        self.limiter.update_from_headers(&response.headers);
        self.classify(&url, response)
    }

    fn classify(&self, url: &str, response: HttpResponse) -> Result<Value, ApiError> {
        match response.status {
            200..=299 => {
                let value = if response.body.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&response.body).map_err(|e| {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        ApiError::Api {
                            status: Some(response.status),
                            message: format!("Failed to parse response from {}: {}", url, e),
                            body: Some(response.body.clone()),
                        }
                    })?
                };

                self.stats.successful.fetch_add(1, Ordering::Relaxed);
                self.limiter.report_success();
                Ok(value)
            }
            401 => Err(ApiError::Authentication {
                message: "Invalid API key".to_string(),
            }),
            404 => Err(ApiError::NotFound {
                url: url.to_string(),
            }),
            429 => {
                self.stats.rate_limit_errors.fetch_add(1, Ordering::Relaxed);
                let retry_after = response.header("retry-after").and_then(parse_retry_after);
                self.limiter.report_rate_limited(retry_after);
                Err(ApiError::RateLimit { retry_after })
            }
            status => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.limiter.report_error(status);
                tracing::error!("API error {} from {}", status, url);
                Err(ApiError::from_status(status, response.body))
            }
        }
    }
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<f64>().ok().and_then(hint_duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::{ApiErrorKind, TransportError};
    use crate::api::rate_limiter::RateLimiterConfig;
    use crate::api::transport::MockHttpTransport;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    fn config() -> ClientConfig {
        ClientConfig::new("https://api.test/", "test-key")
    }

    fn client_with(mock: MockHttpTransport, config: ClientConfig) -> RequestClient {
        let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimiterConfig::default()));
        RequestClient::with_transport(config, limiter, Arc::new(mock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_get_skips_transport() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"data":[{"ticker":"SPY"}]}"#)));
        let client = client_with(mock, config());

        let first = client
            .get("/api/darkpool/SPY", &[("limit", "100")], true)
            .await
            .unwrap();
        let second = client
            .get("/api/darkpool/SPY", &[("limit", "100")], true)
            .await
            .unwrap();

        assert_eq!(first, second);
        let stats = client.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_size, 1);
        assert_eq!(stats.rate_limiter.requests_last_minute, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameter_order_shares_cache_entry() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, "[]")));
        let client = client_with(mock, config());

        client
            .get("/api/option-trades/flow-alerts", &[("a", "1"), ("b", "2")], true)
            .await
            .unwrap();
        client
            .get("/api/option-trades/flow-alerts", &[("b", "2"), ("a", "1")], true)
            .await
            .unwrap();

        assert_eq!(client.stats().await.cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(2)
            .returning(|_| Ok(HttpResponse::new(200, "{}")));
        let mut config = config();
        config.cache_ttl = Duration::from_secs(60);
        let client = client_with(mock, config);

        client.get("/api/market/top-net-impact", &[], true).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        client.get("/api/market/top-net-impact", &[], true).await.unwrap();

        assert_eq!(client.stats().await.cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_cache_false_always_hits_transport() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(2)
            .returning(|_| Ok(HttpResponse::new(200, "{}")));
        let client = client_with(mock, config());

        client.get("/api/news/headlines", &[], false).await.unwrap();
        client.get("/api/news/headlines", &[], false).await.unwrap();

        let stats = client.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.cache_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(401, "bad key")));
        let client = client_with(mock, config());

        let err = client.get("/api/stock/SPY/greeks", &[], true).await.unwrap_err();

        assert_eq!(err.kind(), ApiErrorKind::Authentication);
        assert_eq!(client.stats().await.total_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(404, "")));
        let client = client_with(mock, config());

        let err = client.get("/api/shorts/ZZZZ/data", &[], true).await.unwrap_err();

        match err {
            ApiError::NotFound { url } => assert_eq!(url, "https://api.test/api/shorts/ZZZZ/data"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_response_counts_and_surfaces() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(429, "").with_header("Retry-After", "4")));
        let mut config = config();
        config.retry = RetryConfig::no_retry();
        let client = client_with(mock, config);

        let err = client.get("/api/congress/recent-trades", &[], true).await.unwrap_err();

        match err {
            ApiError::RateLimit { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(4)))
            }
            other => panic!("expected RateLimit, got {:?}", other),
        }
        let stats = client.stats().await;
        assert_eq!(stats.rate_limit_errors, 1);
        assert_eq!(stats.failed_requests, 0);
        assert_eq!(stats.server_quota.backoff_for, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_then_success_honours_retry_after() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_execute().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(HttpResponse::new(429, "").with_header("retry-after", "5"))
            } else {
                Ok(HttpResponse::new(200, r#"{"ok":true}"#))
            }
        });
        let client = client_with(mock, config());
        let start = Instant::now();

        let value = client.get("/api/market/correlations", &[], true).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert!(start.elapsed() >= Duration::from_secs(5));
        let stats = client.stats().await;
        assert_eq!(stats.rate_limit_errors, 1);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.server_quota.backoff_for, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absurd_retry_after_is_dropped() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_execute().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(HttpResponse::new(429, "").with_header("retry-after", "1e30"))
            } else {
                Ok(HttpResponse::new(200, r#"{"ok":true}"#))
            }
        });
        let client = client_with(mock, config());
        let start = Instant::now();

        let value = client.get("/x", &[], false).await.unwrap();

        assert_eq!(value, json!({"ok": true}));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(client.stats().await.rate_limit_errors, 1);
    }

    #[test]
    fn test_parse_retry_after_bounds() {
        assert_eq!(parse_retry_after(" 2 "), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("1e30"), None);
        assert_eq!(parse_retry_after("1e19"), None);
        assert_eq!(parse_retry_after("-4"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retries_and_surface_last() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_execute().times(3).returning(move |_| {
            calls += 1;
            Ok(HttpResponse::new(500 + calls, format!("failure {}", calls)))
        });
        let client = client_with(mock, config());

        let err = client.get("/api/stock/SPY/oi-per-strike", &[], true).await.unwrap_err();

        match err {
            ApiError::Api { status, body, .. } => {
                assert_eq!(status, Some(503));
                assert_eq!(body.as_deref(), Some("failure 3"));
            }
            other => panic!("expected Api, got {:?}", other),
        }
        let stats = client.stats().await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failed_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_retried() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_execute().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(TransportError::Connect("connection refused".into()))
            } else {
                Ok(HttpResponse::new(200, "{}"))
            }
        });
        let client = client_with(mock, config());

        assert!(client.get("/api/stock/SPY/greeks", &[], true).await.is_ok());
        let stats = client.stats().await;
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_is_never_cached_and_carries_auth() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .withf(|req| {
                req.method == HttpMethod::Post
                    && req.headers.get("authorization").map(String::as_str)
                        == Some("Bearer test-key")
                    && req.body == Some(json!({"tickers": ["SPY"]}))
            })
            .times(2)
            .returning(|_| Ok(HttpResponse::new(201, r#"{"id":7}"#)));
        let client = client_with(mock, config());

        for _ in 0..2 {
            let value = client
                .post("/api/screener", Some(json!({"tickers": ["SPY"]})), &[])
                .await
                .unwrap();
            assert_eq!(value, json!({"id": 7}));
        }
        assert_eq!(client.stats().await.cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_headers_feed_limiter() {
        let mut mock = MockHttpTransport::new();
        mock.expect_execute().times(1).returning(|_| {
            Ok(HttpResponse::new(200, "{}")
                .with_header("X-RateLimit-Limit", "120")
                .with_header("X-RateLimit-Remaining", "42"))
        });
        let client = client_with(mock, config());

        client.get("/api/institution/latest_filings", &[], true).await.unwrap();

        let quota = client.stats().await.server_quota;
        assert_eq!(quota.limit, Some(120));
        assert_eq!(quota.remaining, Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_json_decodes_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Envelope {
            data: Vec<u32>,
        }

        let mut mock = MockHttpTransport::new();
        mock.expect_execute()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"data":[1,2,3]}"#)));
        let client = client_with(mock, config());

        let envelope: Envelope = client.get_json("/api/stock/SPY/greeks", &[]).await.unwrap();
        assert_eq!(envelope.data, vec![1, 2, 3]);
    }

    struct StalledTransport;

    #[async_trait]
    impl HttpTransport for StalledTransport {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_call_times_out() {
        let mut config = config();
        config.request_timeout = Duration::from_secs(2);
        config.retry = RetryConfig::no_retry();
        let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimiterConfig::default()));
        let client = RequestClient::with_transport(config, limiter, Arc::new(StalledTransport));
        let start = Instant::now();

        let err = client.get("/api/stock/SPY/greeks", &[], true).await.unwrap_err();

        assert_eq!(err.kind(), ApiErrorKind::Api);
        assert_eq!(err.status(), None);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(client.stats().await.failed_requests, 1);
    }
}
