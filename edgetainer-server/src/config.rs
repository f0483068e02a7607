//! Server configuration.

use std::path::PathBuf;

use clap::Parser;
use edgetainer_core::{TunnelError, TunnelResult, DEFAULT_END_PORT, DEFAULT_SSH_PORT, DEFAULT_START_PORT};

/// Edgetainer management server: SSH tunnel endpoint and reverse proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "edgetainer-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address the SSH tunnel listener binds to
    #[arg(long, env = "EDGETAINER_SSH_HOST", default_value = "0.0.0.0")]
    pub ssh_host: String,

    /// Port for device tunnel connections
    #[arg(long, env = "EDGETAINER_SSH_PORT", default_value_t = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,

    /// Path to the server host key (generated on first start if absent)
    #[arg(long, env = "EDGETAINER_HOST_KEY_PATH", default_value = "ssh_host_key")]
    pub host_key_path: PathBuf,

    /// First port of the reverse-forward range (inclusive)
    #[arg(long, env = "EDGETAINER_START_PORT", default_value_t = DEFAULT_START_PORT)]
    pub start_port: u16,

    /// Last port of the reverse-forward range (inclusive)
    #[arg(long, env = "EDGETAINER_END_PORT", default_value_t = DEFAULT_END_PORT)]
    pub end_port: u16,

    /// Transport keepalive interval in seconds
    #[arg(long, env = "EDGETAINER_KEEPALIVE_INTERVAL", default_value = "30")]
    pub keepalive_interval: u64,

    /// Seconds without a keepalive reply before a connection is dropped
    #[arg(long, env = "EDGETAINER_KEEPALIVE_TIMEOUT", default_value = "30")]
    pub keepalive_timeout: u64,

    /// Default deadline for command replies, in seconds
    #[arg(long, env = "EDGETAINER_COMMAND_TIMEOUT", default_value = "30")]
    pub command_timeout: u64,

    /// Idle cap on tunneled byte-streams, in seconds
    #[arg(long, env = "EDGETAINER_IDLE_TIMEOUT", default_value = "600")]
    pub idle_timeout: u64,

    /// Directory of per-device public key fragments
    #[arg(long, env = "EDGETAINER_DEVICE_KEYS_DIR", default_value = "device-keys")]
    pub device_keys_dir: PathBuf,

    /// Port for the HTTPS reverse proxy; disabled when unset
    #[arg(long, env = "EDGETAINER_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// JSON file mapping HTTP hosts to device services
    #[arg(long, env = "EDGETAINER_PROXY_HOSTS_FILE")]
    pub proxy_hosts_file: Option<PathBuf>,

    /// TLS certificate for the proxy (PEM); plain HTTP when unset
    #[arg(long, env = "EDGETAINER_PROXY_CERT_PATH")]
    pub proxy_cert_path: Option<String>,

    /// TLS private key for the proxy (PEM)
    #[arg(long, env = "EDGETAINER_PROXY_KEY_PATH")]
    pub proxy_key_path: Option<String>,

    /// Bearer token required by host bindings marked auth-required
    #[arg(long, env = "EDGETAINER_PROXY_AUTH_TOKEN")]
    pub proxy_auth_token: Option<String>,

    /// Enable debug logging
    #[arg(long, env = "EDGETAINER_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    /// Check cross-field constraints. Fatal at startup when violated.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.start_port > self.end_port {
            return Err(TunnelError::Config(format!(
                "invalid port range {}-{}",
                self.start_port, self.end_port
            )));
        }
        if self.keepalive_interval == 0 {
            return Err(TunnelError::Config(
                "keepalive interval must be at least 1 second".into(),
            ));
        }
        if self.proxy_cert_path.is_some() != self.proxy_key_path.is_some() {
            return Err(TunnelError::Config(
                "proxy TLS needs both a certificate and a key".into(),
            ));
        }
        Ok(())
    }

    /// Bind address for the SSH listener.
    pub fn ssh_listen_addr(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    /// Bind address for the reverse proxy, if enabled.
    pub fn proxy_listen_addr(&self) -> Option<String> {
        self.proxy_port
            .map(|port| format!("{}:{}", self.ssh_host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ServerConfig {
        ServerConfig::parse_from(["edgetainer-server"])
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.start_port, 10000);
        assert_eq!(config.end_port, 20000);
        assert_eq!(config.command_timeout, 30);
        assert_eq!(config.ssh_listen_addr(), "0.0.0.0:2222");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = base();
        config.start_port = 20000;
        config.end_port = 10000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_half_configured_tls() {
        let mut config = base();
        config.proxy_cert_path = Some("cert.pem".into());
        assert!(config.validate().is_err());
        config.proxy_key_path = Some("key.pem".into());
        assert!(config.validate().is_ok());
    }
}
