//! Readiness probing for freshly launched services.
//!
//! A probe is a liveness check only: any HTTP response on the service's port,
//! whatever its status code, counts as ready. Connection errors and attempt
//! timeouts are retried at a fixed interval until the attempt budget runs out.

use crate::config::ProbeConfig;
use crate::launcher::SERVICE_HOST;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Bounded retry policy for one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        ProbePolicy::from(&ProbeConfig::default())
    }
}

impl From<&ProbeConfig> for ProbePolicy {
    fn from(config: &ProbeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            interval: Duration::from_millis(config.interval_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

/// Outcome of a probe that ran out of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeExhausted {
    pub attempts: u32,
}

/// Retried HTTP GET against `/` on a loopback port
#[derive(Clone)]
pub struct ReadinessProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    policy: ProbePolicy,
}

impl ReadinessProbe {
    pub fn new(policy: ProbePolicy) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(policy.attempt_timeout));

        // No idle connections: every attempt must prove a fresh connect works
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client, policy }
    }

    /// One attempt; `true` if the port answered with any HTTP response
    pub async fn check_once(&self, port: u16) -> bool {
        let uri = format!("http://{}:{}/", SERVICE_HOST, port);
        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header(hyper::header::CONNECTION, "close")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(self.policy.attempt_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(port, status = %response.status(), "Probe got a response");
                true
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "Probe attempt failed");
                false
            }
            Err(_) => {
                debug!(port, "Probe attempt timed out");
                false
            }
        }
    }

    /// Retry until the port answers or the budget is spent.
    ///
    /// Returns the number of attempts used on success.
    pub async fn wait_ready(&self, port: u16) -> Result<u32, ProbeExhausted> {
        for attempt in 1..=self.policy.max_attempts {
            if self.check_once(port).await {
                return Ok(attempt);
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }
        Err(ProbeExhausted {
            attempts: self.policy.max_attempts,
        })
    }
}
