use proxyfleet::api::{ControlApi, PKG_NAME, VERSION};
use proxyfleet::config::FleetConfig;
use proxyfleet::fleet::FleetService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "proxyfleet.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyfleet=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        FleetConfig::default()
    } else {
        let config = FleetConfig::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    let fleet = Arc::new(FleetService::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if config.health.enabled {
        let outcome = fleet.start_health_monitor(None).await?;
        info!(?outcome, interval_ms = config.health.interval_ms, "Health monitor enabled");
    }

    let api_addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.api.bind, port = config.api.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    let api_token = config.api.token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure api.token to set a fixed value)");
        token
    });

    let api = ControlApi::new(api_addr, Arc::clone(&fleet), shutdown_rx, api_token);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Control API error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    if fleet.stop_health_monitor().await {
        info!("Health monitor stopped");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
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
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &FleetConfig) {
    info!("========================================");
    info!("  {} v{}", PKG_NAME, VERSION);
    info!("========================================");
    info!(
        api = %format!("{}:{}", config.api.bind, config.api.port),
        store = ?config.store.backend,
        path = %config.store.path,
        "Control plane"
    );
    if config.health.enabled {
        info!(
            interval_ms = config.health.interval_ms,
            probe_timeout_ms = config.health.probe_timeout_ms,
            "Health monitoring"
        );
    } else {
        info!("Health monitoring disabled (start it via POST /health-monitor/start)");
    }
}
