use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::Config;
use wakegate::git::CommandGitHandler;
use wakegate::pool::{ConnectionPool, PoolConfig};
use wakegate::process::Supervisor;
use wakegate::proxy::ProxyServer;
use wakegate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("wakegate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));
    let supervisor = Supervisor::new(config.launch_backend()?, pool);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let mut proxy = ProxyServer::new(addr, Arc::clone(&supervisor), shutdown_rx);
    if config.git.enabled {
        let handler = CommandGitHandler::from_config(&config);
        proxy = proxy.with_git_handler(Arc::new(handler));
        info!(
            path = %format!("{}/_git", config.backend.base_path),
            "Git action endpoint enabled"
        );
    }

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    supervisor.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        pool_max_idle = config.server.pool_max_idle,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Server configuration"
    );

    let backend = &config.backend;
    info!(
        command = %backend.command,
        args = ?backend.args,
        working_dir = ?backend.working_dir,
        address = %backend.authority(),
        base_path = %backend.base_path,
        "Backend (started on first request)"
    );
    info!(
        idle_timeout_secs = backend.idle_timeout_secs,
        request_timeout_secs = backend.request_timeout_secs,
        shutdown_grace_period_secs = backend.shutdown_grace_period_secs,
        show_output = backend.show_output,
        "Lifecycle settings"
    );

    let retry = &backend.retry;
    info!(
        initial_delay_ms = retry.initial_delay_ms,
        step_ms = retry.step_ms,
        max_delay_ms = ?retry.max_delay_ms,
        startup_timeout_secs = retry.startup_timeout_secs,
        max_boot_failures = retry.max_boot_failures,
        "Boot retry policy"
    );
}
