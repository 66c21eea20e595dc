//! Whole-program lifecycle: start services, open the listener, wait for a
//! signal or a dead child, tear everything down.

use crate::config::Config;
use crate::error::SupervisorError;
use crate::pool::PoolConfig;
use crate::proxy::ProxyServer;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::supervisor::Supervisor;
use anyhow::Context;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for the accept loop to notice the shutdown broadcast
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse the public listen address from config
pub fn listen_addr(config: &Config) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {:?}", config.server.bind))?;
    Ok(SocketAddr::new(ip, config.server.port))
}

/// Run the supervisor until `signals` resolves or a service dies.
///
/// Returns `Ok(())` after a signal-driven shutdown and an error for every
/// fatal condition; the public listener is never bound unless every service
/// passed its readiness probe.
pub async fn run<F>(
    config: Config,
    coordinator: &ShutdownCoordinator,
    signals: F,
) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<ShutdownSignal>>,
{
    let addr = listen_addr(&config)?;
    let mut supervisor = Supervisor::from_config(&config)?;
    tokio::pin!(signals);

    tokio::select! {
        result = supervisor.start() => result?,
        signal = &mut signals => {
            let signal = signal?;
            info!(%signal, "Signal received during startup, stopping services");
            coordinator.begin_drain();
            supervisor.shutdown().await;
            coordinator.finish();
            return Ok(());
        }
    }

    for service in supervisor.services() {
        info!(
            service = %service.spec().name,
            pid = ?service.pid(),
            port = service.spec().port,
            state = ?service.state(),
            "Service running"
        );
    }

    let routes = supervisor.routes();
    for rule in routes.rules() {
        debug!(prefix = %rule.prefix, service = %rule.target.service, "Route");
    }
    debug!(service = %routes.fallback().service, "Fallback route");

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let proxy = match ProxyServer::bind_with(
        addr,
        routes,
        coordinator.subscribe(),
        pool_config,
        config.server.upstream_timeout(),
    )
    .await
    {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind public listener");
            supervisor.shutdown().await;
            return Err(anyhow::Error::new(e).context(format!("Failed to bind {}", addr)));
        }
    };

    let stats = proxy.stats();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let outcome = tokio::select! {
        signal = &mut signals => {
            match signal {
                Ok(signal) => {
                    info!(%signal, "Shutting down");
                    Ok(())
                }
                Err(e) => Err(e.context("Failed to listen for signals")),
            }
        }
        exit = supervisor.wait_for_exit() => {
            match exit {
                Some(exit) => {
                    error!(service = %exit.service, status = %exit.status, "Service died, shutting down");
                    Err(SupervisorError::UnexpectedExit {
                        service: exit.service,
                        status: exit.status,
                    }
                    .into())
                }
                None => Err(anyhow::anyhow!("Service monitor channel closed")),
            }
        }
    };

    coordinator.begin_drain();
    supervisor.shutdown().await;
    coordinator.finish();

    if tokio::time::timeout(LISTENER_STOP_TIMEOUT, proxy_handle).await.is_err() {
        warn!("Proxy listener did not stop in time");
    }

    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Shutdown complete"
    );
    outcome
}
