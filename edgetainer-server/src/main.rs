//! Edgetainer management server binary.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use edgetainer_server::config::ServerConfig;
use edgetainer_server::directory::{DeviceDirectory, MemoryDirectory};
use edgetainer_server::tunnel::TunnelServer;
use edgetainer_server::{proxy, shutdown};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting edgetainer-server v{}", env!("CARGO_PKG_VERSION"));
    info!("SSH listener: {}", config.ssh_listen_addr());
    info!(
        "Forward port range: {}-{}",
        config.start_port, config.end_port
    );

    config.validate()?;

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let directory = Arc::new(MemoryDirectory::from_keys_dir(&config.device_keys_dir)?);
    if let Some(path) = &config.proxy_hosts_file {
        let count = directory.load_host_bindings(path)?;
        info!(count, "Proxy host bindings loaded");
    }
    let directory: Arc<dyn DeviceDirectory> = directory;

    let server = TunnelServer::new(config.clone(), Arc::clone(&directory));
    server.start().await?;

    let proxy_handle = if config.proxy_port.is_some() {
        let proxy_server = Arc::clone(&server);
        let proxy_directory = Arc::clone(&directory);
        Some(tokio::spawn(async move {
            if let Err(e) = proxy::run_proxy_server(proxy_server, proxy_directory).await {
                warn!(error = %e, "Reverse proxy stopped");
            }
        }))
    } else {
        info!("Reverse proxy disabled (set EDGETAINER_PROXY_PORT to enable)");
        None
    };

    info!("Server is ready to accept device connections");
    shutdown::wait_for_signal().await;

    server.shutdown().await;
    if let Some(handle) = proxy_handle {
        let _ = handle.await;
    }

    info!("Edgetainer server stopped");
    Ok(())
}
