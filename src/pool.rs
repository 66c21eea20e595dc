//! Pooled outbound HTTP client used to forward requests to services.
//!
//! Request and response bodies are passed through as streams; nothing here
//! buffers a body.

use crate::launcher::SERVICE_HOST;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for forwarding through the pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Connecting to, writing to or reading from the service failed
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The outbound request could not be built
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// True when no connection to the service could be established
    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::Client(e) if e.is_connect())
    }
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per service
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared client for all forwarded requests
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to the service on `port`, path and query unchanged.
    ///
    /// The inbound `Host` header is dropped; the client derives a loopback
    /// `Host` from the target URI instead.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError> {
        let backend_req = build_backend_request(req, port)?;

        self.stats.record_request();
        self.client.request(backend_req).await.map_err(|e| {
            self.stats.record_failure();
            PoolError::from(e)
        })
    }
}

/// Retarget a request at a loopback port, keeping everything but `Host`
pub fn build_backend_request<B>(req: Request<B>, port: u16) -> Result<Request<B>, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}:{}{}", SERVICE_HOST, port, path);

    let (mut parts, body) = req.into_parts();
    parts.uri = uri
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?;
    parts.headers.remove(hyper::header::HOST);
    // Inbound h2 requests still go out over HTTP/1.1
    parts.version = hyper::Version::HTTP_11;

    Ok(Request::from_parts(parts, body))
}

/// Box an upstream response so it can share a type with locally built ones
pub fn boxed_response(response: Response<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, HOST};
    use hyper::Method;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.stats().get_total_requests(), 0);
        assert_eq!(pool.stats().get_failed_requests(), 0);
    }

    #[test]
    fn test_backend_request_keeps_path_and_drops_host() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/admin/users?page=2")
            .header(HOST, "portal.example.com")
            .header("cookie", "session=abc")
            .header("content-type", "application/json")
            .body(())
            .unwrap();

        let out = build_backend_request(req, 3001).unwrap();

        assert_eq!(out.method(), Method::POST);
        assert_eq!(out.uri().to_string(), "http://127.0.0.1:3001/admin/users?page=2");
        assert!(out.headers().get(HOST).is_none());
        assert_eq!(
            out.headers().get("cookie"),
            Some(&HeaderValue::from_static("session=abc"))
        );
        assert_eq!(out.headers().get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_backend_request_from_absolute_uri() {
        let req = Request::builder()
            .uri("http://portal.example.com/photo.png")
            .body(())
            .unwrap();

        let out = build_backend_request(req, 3003).unwrap();
        assert_eq!(out.uri().to_string(), "http://127.0.0.1:3003/photo.png");
        assert_eq!(out.version(), hyper::Version::HTTP_11);
    }
}
