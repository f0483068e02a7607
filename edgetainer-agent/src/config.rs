//! Agent configuration.

use std::path::PathBuf;

use clap::Parser;
use edgetainer_core::DEFAULT_SSH_PORT;

/// Edgetainer device agent: maintains the reverse tunnel to the
/// management server and runs its commands.
#[derive(Parser, Debug, Clone)]
#[command(name = "edgetainer-agent")]
#[command(author, version, about, long_about = None)]
pub struct AgentConfig {
    /// Provisioned device identifier; doubles as the SSH user name
    #[arg(long, env = "EDGETAINER_DEVICE_ID")]
    pub device_id: String,

    /// Management server host
    #[arg(long, env = "EDGETAINER_SERVER_HOST", default_value = "localhost")]
    pub server_host: String,

    /// Management server tunnel port
    #[arg(long, env = "EDGETAINER_SSH_PORT", default_value_t = DEFAULT_SSH_PORT)]
    pub ssh_port: u16,

    /// Path to the device's private key
    #[arg(long, env = "EDGETAINER_SSH_KEY", default_value = "ssh_key")]
    pub key_path: PathBuf,

    /// Pinned server host key fingerprint (SHA256:...), handed over at
    /// provisioning; any key is accepted when unset
    #[arg(long, env = "EDGETAINER_SERVER_FINGERPRINT")]
    pub server_fingerprint: Option<String>,

    /// Local SSH daemon port exposed through the shell forward
    #[arg(long, env = "EDGETAINER_LOCAL_SSH_PORT", default_value = "22")]
    pub local_ssh_port: u16,

    /// Additional local service ports to expose through the tunnel
    #[arg(long = "forward", env = "EDGETAINER_FORWARD_PORTS", value_delimiter = ',')]
    pub forward_ports: Vec<u16>,

    /// Seconds between heartbeats
    #[arg(long, env = "EDGETAINER_HEARTBEAT_INTERVAL", default_value = "30")]
    pub heartbeat_interval: u64,

    /// Transport keepalive interval in seconds
    #[arg(long, env = "EDGETAINER_KEEPALIVE_INTERVAL", default_value = "30")]
    pub keepalive_interval: u64,

    /// Seconds without a keepalive reply before reconnecting
    #[arg(long, env = "EDGETAINER_KEEPALIVE_TIMEOUT", default_value = "30")]
    pub keepalive_timeout: u64,

    /// Directory where deployed compose projects live
    #[arg(long, env = "EDGETAINER_COMPOSE_DIR", default_value = "compose")]
    pub compose_dir: PathBuf,

    /// Enable debug logging
    #[arg(long, env = "EDGETAINER_DEBUG")]
    pub debug: bool,
}

impl AgentConfig {
    /// The server endpoint to dial.
    pub fn server_addr(&self) -> (String, u16) {
        (self.server_host.clone(), self.ssh_port)
    }
}
