use gatehouse::app;
use gatehouse::config::Config;
use gatehouse::shutdown::{self, ShutdownCoordinator};
use std::path::PathBuf;
use tracing::{error, info};

/// Version information for the supervisor
const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatehouse=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gatehouse.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let coordinator = ShutdownCoordinator::new();
    app::run(config, &coordinator, shutdown::wait_for_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "Supervisor stopped with an error");
            e
        })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        upstream_timeout_secs = config.server.upstream_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        "Public listener configuration"
    );
    info!(
        max_attempts = config.probe.max_attempts,
        interval_ms = config.probe.interval_ms,
        attempt_timeout_ms = config.probe.attempt_timeout_ms,
        "Readiness probe policy"
    );
    for service in &config.services {
        info!(
            service = %service.name,
            command = %service.command,
            port = service.port,
            prefix = if service.is_fallback() { "(fallback)" } else { service.prefix.as_str() },
            "Configured service"
        );
    }
}
