use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{boxed_response, ConnectionPool, PoolConfig, PoolStats};
use crate::routing::{RouteDecision, RouteTable, RouteTarget};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Default time allowed for upstream response headers
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a request handler needs, shared by all connections
struct ProxyContext {
    routes: Arc<RouteTable>,
    pool: ConnectionPool,
    upstream_timeout: Duration,
}

/// Public listener that routes each request to one service.
///
/// [`bind`](ProxyServer::bind) opens the socket and [`run`](ProxyServer::run)
/// serves it until the shutdown channel flips to `true`, at which point the
/// listener is dropped and no further connections are accepted.
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        routes: Arc<RouteTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        Self::bind_with(addr, routes, shutdown_rx, PoolConfig::default(), DEFAULT_UPSTREAM_TIMEOUT).await
    }

    pub async fn bind_with(
        addr: SocketAddr,
        routes: Arc<RouteTable>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        upstream_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let context = Arc::new(ProxyContext {
            routes,
            pool: ConnectionPool::new(pool_config),
            upstream_timeout,
        });
        Ok(Self {
            listener,
            context,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Forwarding counters; stay readable after `run` consumes the server
    pub fn stats(&self) -> Arc<PoolStats> {
        self.context.pool.stats()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, context).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy stopped accepting connections");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    client_addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let target = match context.routes.resolve(req.uri().path(), req.uri().query()) {
        RouteDecision::Redirect { location } => {
            debug!(path = %req.uri().path(), %location, "Redirecting bare prefix");
            return Ok(build_redirect(&location));
        }
        RouteDecision::Forward(target) => target.clone(),
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    set_forwarding_headers(&mut req, client_addr, &request_id);

    debug!(
        service = %target.service,
        port = target.port,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Forwarding request"
    );

    if is_upgrade_request(&req) {
        return Ok(handle_upgrade(req, &context, target, request_id).await);
    }

    let result = tokio::time::timeout(
        context.upstream_timeout,
        context.pool.send_request(req, target.port),
    )
    .await;

    match result {
        // Errors after this point surface as an aborted client connection, not a 502
        Ok(Ok(response)) => Ok(boxed_response(response)),
        Ok(Err(e)) => {
            error!(
                service = %target.service,
                port = target.port,
                request_id,
                connect = e.is_connect(),
                error = %e,
                "Upstream request failed"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                format!("Service '{}' is unavailable", target.service),
            ))
        }
        Err(_) => {
            warn!(
                service = %target.service,
                port = target.port,
                request_id,
                timeout_secs = context.upstream_timeout.as_secs(),
                "Upstream timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!("Service '{}' did not respond in time", target.service),
            ))
        }
    }
}

/// Overwrite X-Forwarded-* and X-Request-ID. This proxy is the first trusted
/// hop, so client-supplied forwarding headers are replaced, not appended to.
fn set_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, request_id: &str) {
    let authority = req.uri().authority().map(|a| a.to_string());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    // HTTP/2 carries the host in `:authority` instead of a Host header
    let host = headers.get(hyper::header::HOST).cloned().or_else(|| {
        authority
            .as_deref()
            .and_then(|authority| HeaderValue::from_str(authority).ok())
    });
    match host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// 301 to the canonical trailing-slash form of a bare prefix
fn build_redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let location = HeaderValue::from_str(location).unwrap_or_else(|_| HeaderValue::from_static("/"));

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Moved Permanently"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check for `Connection: upgrade` together with an `Upgrade` header
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forward an upgrade request (WebSocket, etc.) and splice both connections
/// together once the service answers `101 Switching Protocols`.
async fn handle_upgrade(
    mut req: Request<Incoming>,
    context: &ProxyContext,
    target: RouteTarget,
    request_id: String,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let mut response = match tokio::time::timeout(
        context.upstream_timeout,
        context.pool.send_request(req, target.port),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(service = %target.service, request_id, error = %e, "Upgrade request failed");
            return json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("Service '{}' is unavailable", target.service),
            );
        }
        Err(_) => {
            warn!(service = %target.service, request_id, "Upgrade request timed out");
            return json_error_response(
                ProxyErrorCode::UpstreamTimeout,
                format!("Service '{}' did not respond in time", target.service),
            );
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(service = %target.service, status = %response.status(), "Service declined upgrade");
        return boxed_response(response);
    }

    let upstream_upgrade = hyper::upgrade::on(&mut response);
    let service = target.service.clone();

    tokio::spawn(async move {
        let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(service, request_id, error = %e, "Upgrade handshake failed");
                return;
            }
        };

        let mut client_io = TokioIo::new(client);
        let mut upstream_io = TokioIo::new(upstream);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((to_upstream, to_client)) => {
                debug!(service, request_id, to_upstream, to_client, "Upgraded connection closed");
            }
            Err(e) => {
                debug!(service, request_id, error = %e, "Upgraded connection closed with error");
            }
        }
    });

    info!(service = %target.service, "Connection upgraded");
    boxed_response(response)
}
