//! Edgetainer device agent binary.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use edgetainer_agent::commands::{CommandDispatcher, ComposeRunner};
use edgetainer_agent::config::AgentConfig;
use edgetainer_agent::monitor::SystemMonitor;
use edgetainer_agent::tunnel::TunnelClient;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::parse();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting edgetainer-agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Device ID: {}", config.device_id);
    info!("Server: {}:{}", config.server_host, config.ssh_port);
    if !config.forward_ports.is_empty() {
        info!("Service forwards: {:?}", config.forward_ports);
    }

    let config = Arc::new(config);
    let monitor = Arc::new(SystemMonitor::new());
    let runner = ComposeRunner::new(config.compose_dir.clone());
    let dispatcher = Arc::new(CommandDispatcher::new(runner, Arc::clone(&monitor)));

    let client = TunnelClient::new(Arc::clone(&config), dispatcher, monitor);
    client.connect();

    wait_for_signal().await;

    client.disconnect().await;
    info!("Edgetainer agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
