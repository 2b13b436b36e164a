use proxyvisor::balancer::RoundRobin;
use proxyvisor::config::Config;
use proxyvisor::control::{ControlServer, ControlState, PKG_NAME, VERSION};
use proxyvisor::login::LoginLauncher;
use proxyvisor::pool::PoolConfig;
use proxyvisor::process::{StartOutcome, Supervisor};
use proxyvisor::proxy::ProxyServer;
use proxyvisor::registry::{expand_home, BackendRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyvisor=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(BackendRegistry::from_config(&config));
    let supervisor = Supervisor::new(Arc::clone(&registry), config.server.restart_delay());

    for backend in registry.iter().filter(|b| b.autostart) {
        match supervisor.start(&backend.id) {
            Ok(StartOutcome::Started { pid }) => info!(id = %backend.id, pid, "Backend autostarted"),
            Ok(StartOutcome::AlreadyRunning { .. }) => {}
            Err(e) => error!(id = %backend.id, error = %e, "Failed to autostart backend"),
        }
    }

    let launcher = LoginLauncher::new(config.defaults.login_terminal.as_deref())?;

    let control_addr = socket_addr(&config.server.bind, config.server.control_port)?;
    let control_state = ControlState::new(Arc::clone(&supervisor))
        .with_login_launcher(launcher)
        .with_static_dir(config.server.static_dir.as_deref().map(expand_home))
        .with_auth_token(config.server.control_token.clone())
        .with_stop_action(config.server.enable_stop_action);
    let control_server = ControlServer::new(control_addr, control_state, shutdown_rx.clone());

    let balancer_addr = socket_addr(&config.server.bind, config.server.balancer_port)?;
    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let rotation = Arc::new(RoundRobin::from_registry(&registry));
    let proxy_server = ProxyServer::new(
        balancer_addr,
        rotation,
        config.server.request_timeout(),
        shutdown_rx.clone(),
    )
    .with_pool_config(pool_config)
    .with_upstream_host(config.server.upstream_host.clone());

    let control_handle = tokio::spawn(async move {
        if let Err(e) = control_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Load balancer error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    info!("Stopping all backends...");
    supervisor.stop_all();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = control_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address '{}:{}': {}", bind, port, e)
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT (Ctrl+C), shutting down...");
            return;
        }
    };

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
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting supervisor");
    info!(
        bind = %config.server.bind,
        control_port = config.server.control_port,
        balancer_port = config.server.balancer_port,
        upstream_host = %config.server.upstream_host,
        static_dir = ?config.server.static_dir,
        control_token = config.server.control_token.is_some(),
        enable_stop_action = config.server.enable_stop_action,
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        restart_delay_ms = config.server.restart_delay_ms,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
    info!(
        command = %config.defaults.command,
        credential_dir = %config.defaults.credential_dir,
        login_terminal = ?config.defaults.login_terminal,
        "Backend defaults"
    );
    for backend in &config.backends {
        info!(
            id = %backend.id,
            port = backend.port,
            working_dir = %backend.working_dir,
            autostart = backend.autostart(&config.defaults),
            "Configured backend"
        );
    }
}
