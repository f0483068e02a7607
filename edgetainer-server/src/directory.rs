//! Device directory: the authoritative store of device identity.
//!
//! The tunnel core only ever talks to the [`DeviceDirectory`] trait; the
//! in-memory implementation here is seeded from a directory of per-device
//! public-key fragments and keeps an informational `authorized_keys` view
//! on disk. Authentication always consults the directory, never the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use edgetainer_core::{Heartbeat, HeartbeatStatus, TunnelError, TunnelResult};
use russh::keys::{HashAlg, PublicKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Online,
    Offline,
    Updating,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Pending => write!(f, "pending"),
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Updating => write!(f, "updating"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

/// One provisioned device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: String,
    /// SHA-256 fingerprint of the single key allowed to claim this
    /// device ID. Immutable for the life of the device.
    pub key_fingerprint: String,
    pub assigned_shell_port: Option<u16>,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
    pub disabled: bool,
    pub ip_address: Option<String>,
    pub agent_version: Option<String>,
}

impl DeviceRecord {
    /// Create a fresh record in the pending state.
    pub fn new(device_id: impl Into<String>, key_fingerprint: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            key_fingerprint: key_fingerprint.into(),
            assigned_shell_port: None,
            last_seen: None,
            status: DeviceStatus::Pending,
            disabled: false,
            ip_address: None,
            agent_version: None,
        }
    }
}

/// Resolution of an inbound HTTP host to a device-local service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBinding {
    pub device_id: String,
    pub container_port: u32,
    #[serde(default)]
    pub auth_required: bool,
}

/// The directory interface the tunnel core consumes.
///
/// Implementations own their synchronization; the core never holds one of
/// its own locks across a directory call.
pub trait DeviceDirectory: Send + Sync {
    /// Look up a device by its claimed identity.
    fn device(&self, device_id: &str) -> Option<DeviceRecord>;

    /// Persist the shell port assigned to a device.
    fn assign_shell_port(&self, device_id: &str, port: u16) -> TunnelResult<()>;

    /// Apply a heartbeat: status, IP, version, last-seen. Out-of-order
    /// heartbeats never move `last_seen` backwards.
    fn record_heartbeat(&self, heartbeat: &Heartbeat);

    /// Mark a device online or offline.
    fn set_connection_state(&self, device_id: &str, online: bool);

    /// Resolve an HTTP host header to a device service, if mapped.
    fn resolve_host(&self, host: &str) -> Option<HostBinding>;
}

/// In-memory directory implementation.
pub struct MemoryDirectory {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    hosts: Mutex<HashMap<String, HostBinding>>,
    keys_dir: Option<PathBuf>,
}

impl MemoryDirectory {
    /// Create an empty directory with no on-disk key view.
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
            keys_dir: None,
        }
    }

    /// Create a directory seeded from per-device key fragments.
    ///
    /// Every regular file in `keys_dir` is read as `<device_id>` →
    /// OpenSSH public key (with or without a leading device-id column).
    pub fn from_keys_dir(keys_dir: impl Into<PathBuf>) -> TunnelResult<Self> {
        let keys_dir = keys_dir.into();
        std::fs::create_dir_all(&keys_dir)
            .map_err(|e| TunnelError::Config(format!("cannot create {}: {e}", keys_dir.display())))?;

        let directory = Self {
            devices: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
            keys_dir: Some(keys_dir.clone()),
        };

        let entries = std::fs::read_dir(&keys_dir)
            .map_err(|e| TunnelError::Config(format!("cannot read {}: {e}", keys_dir.display())))?;
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let device_id = entry.file_name().to_string_lossy().to_string();
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(e) => {
                    warn!(device_id, error = %e, "Skipping unreadable key fragment");
                    continue;
                }
            };
            match parse_public_key(&content) {
                Ok(key) => {
                    let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
                    debug!(device_id, %fingerprint, "Loaded device key");
                    directory
                        .devices
                        .lock()
                        .unwrap()
                        .insert(device_id.clone(), DeviceRecord::new(device_id, fingerprint));
                }
                Err(e) => {
                    warn!(device_id, error = %e, "Skipping invalid key fragment");
                }
            }
        }

        let count = directory.devices.lock().unwrap().len();
        info!(count, keys_dir = %keys_dir.display(), "Device directory loaded");
        directory.rebuild_authorized_keys_view();
        Ok(directory)
    }

    /// Register a device, persisting its key fragment when a keys
    /// directory is configured.
    pub fn insert_device(
        &self,
        device_id: &str,
        public_key_openssh: &str,
    ) -> TunnelResult<DeviceRecord> {
        let key = parse_public_key(public_key_openssh)
            .map_err(|e| TunnelError::Config(format!("invalid public key for {device_id}: {e}")))?;
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        let record = DeviceRecord::new(device_id, fingerprint);

        {
            let mut devices = self.devices.lock().unwrap();
            if devices.contains_key(device_id) {
                return Err(TunnelError::Config(format!(
                    "device {device_id} already registered"
                )));
            }
            devices.insert(device_id.to_string(), record.clone());
        }

        if let Some(keys_dir) = &self.keys_dir {
            let fragment = keys_dir.join(device_id);
            let line = format!("{} {}\n", device_id, public_key_openssh.trim());
            if let Err(e) = std::fs::write(&fragment, line) {
                warn!(device_id, error = %e, "Failed to write key fragment");
            }
            self.rebuild_authorized_keys_view();
        }
        Ok(record)
    }

    /// Map an HTTP host to a device service for the proxy.
    pub fn register_host(&self, host: &str, binding: HostBinding) {
        self.hosts
            .lock()
            .unwrap()
            .insert(host.to_ascii_lowercase(), binding);
    }

    /// Load host bindings from a JSON map of `host → binding`.
    pub fn load_host_bindings(&self, path: &Path) -> TunnelResult<usize> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("cannot read {}: {e}", path.display())))?;
        let bindings: HashMap<String, HostBinding> = serde_json::from_str(&content)
            .map_err(|e| TunnelError::Config(format!("invalid host bindings: {e}")))?;
        let count = bindings.len();
        let mut hosts = self.hosts.lock().unwrap();
        for (host, binding) in bindings {
            hosts.insert(host.to_ascii_lowercase(), binding);
        }
        Ok(count)
    }

    /// Mark a device administratively disabled.
    pub fn set_disabled(&self, device_id: &str, disabled: bool) {
        if let Some(record) = self.devices.lock().unwrap().get_mut(device_id) {
            record.disabled = disabled;
        }
    }

    /// Concatenate all key fragments into the informational
    /// `authorized_keys` file next to the fragment directory.
    fn rebuild_authorized_keys_view(&self) {
        let Some(keys_dir) = &self.keys_dir else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(keys_dir) else {
            return;
        };
        let mut combined = String::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                combined.push_str(content.trim_end());
                combined.push('\n');
            }
        }
        let view = keys_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("authorized_keys");
        if let Err(e) = std::fs::write(&view, combined) {
            warn!(path = %view.display(), error = %e, "Failed to write authorized_keys view");
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDirectory for MemoryDirectory {
    fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().get(device_id).cloned()
    }

    fn assign_shell_port(&self, device_id: &str, port: u16) -> TunnelResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| TunnelError::Config(format!("unknown device {device_id}")))?;
        record.assigned_shell_port = Some(port);
        Ok(())
    }

    fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut devices = self.devices.lock().unwrap();
        let Some(record) = devices.get_mut(&heartbeat.device_id) else {
            return;
        };
        if record
            .last_seen
            .map(|seen| heartbeat.timestamp > seen)
            .unwrap_or(true)
        {
            record.last_seen = Some(heartbeat.timestamp);
            record.status = match heartbeat.status {
                HeartbeatStatus::Ok => DeviceStatus::Online,
                HeartbeatStatus::Updating => DeviceStatus::Updating,
                HeartbeatStatus::Error => DeviceStatus::Error,
            };
            if !heartbeat.ip.is_empty() {
                record.ip_address = Some(heartbeat.ip.clone());
            }
            if !heartbeat.version.is_empty() {
                record.agent_version = Some(heartbeat.version.clone());
            }
        }
    }

    fn set_connection_state(&self, device_id: &str, online: bool) {
        if let Some(record) = self.devices.lock().unwrap().get_mut(device_id) {
            record.status = if online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            };
        }
    }

    fn resolve_host(&self, host: &str) -> Option<HostBinding> {
        // Host headers may carry a port; the mapping is by name only.
        let name = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        self.hosts.lock().unwrap().get(&name).cloned()
    }
}

/// Parse an OpenSSH public key line, tolerating the fragment format that
/// prefixes the device ID.
fn parse_public_key(content: &str) -> Result<PublicKey, russh::keys::ssh_key::Error> {
    let line = content.lines().next().unwrap_or("").trim();
    match PublicKey::from_openssh(line) {
        Ok(key) => Ok(key),
        Err(first_err) => match line.split_once(char::is_whitespace) {
            Some((_, rest)) => PublicKey::from_openssh(rest.trim()),
            None => Err(first_err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    fn test_key() -> (String, String) {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let public = key.public_key();
        (
            public.to_openssh().unwrap(),
            public.fingerprint(HashAlg::Sha256).to_string(),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let directory = MemoryDirectory::new();
        let (openssh, fingerprint) = test_key();
        directory.insert_device("dev-A", &openssh).unwrap();

        let record = directory.device("dev-A").unwrap();
        assert_eq!(record.key_fingerprint, fingerprint);
        assert_eq!(record.status, DeviceStatus::Pending);
        assert!(directory.device("dev-B").is_none());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let directory = MemoryDirectory::new();
        let (openssh, _) = test_key();
        directory.insert_device("dev-A", &openssh).unwrap();
        assert!(directory.insert_device("dev-A", &openssh).is_err());
    }

    #[test]
    fn test_heartbeat_keeps_largest_timestamp() {
        let directory = MemoryDirectory::new();
        let (openssh, _) = test_key();
        directory.insert_device("dev-A", &openssh).unwrap();

        let mut newer = Heartbeat::new("dev-A", HeartbeatStatus::Ok);
        newer.ip = "10.0.0.5".into();
        directory.record_heartbeat(&newer);

        let mut stale = Heartbeat::new("dev-A", HeartbeatStatus::Error);
        stale.timestamp = newer.timestamp - Duration::seconds(30);
        stale.ip = "10.0.0.9".into();
        directory.record_heartbeat(&stale);

        let record = directory.device("dev-A").unwrap();
        assert_eq!(record.last_seen, Some(newer.timestamp));
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_shell_port_assignment_persists() {
        let directory = MemoryDirectory::new();
        let (openssh, _) = test_key();
        directory.insert_device("dev-A", &openssh).unwrap();
        directory.assign_shell_port("dev-A", 10000).unwrap();
        assert_eq!(
            directory.device("dev-A").unwrap().assigned_shell_port,
            Some(10000)
        );
        assert!(directory.assign_shell_port("dev-B", 10001).is_err());
    }

    #[test]
    fn test_resolve_host_ignores_port_and_case() {
        let directory = MemoryDirectory::new();
        directory.register_host(
            "Cam.Example.COM",
            HostBinding {
                device_id: "dev-A".into(),
                container_port: 8080,
                auth_required: false,
            },
        );
        let binding = directory.resolve_host("cam.example.com:443").unwrap();
        assert_eq!(binding.device_id, "dev-A");
        assert_eq!(binding.container_port, 8080);
        assert!(directory.resolve_host("other.example.com").is_none());
    }

    #[test]
    fn test_keys_dir_seed_and_view() {
        let tmp = tempfile::tempdir().unwrap();
        let keys_dir = tmp.path().join("device-keys");
        std::fs::create_dir_all(&keys_dir).unwrap();

        let (plain_key, plain_fp) = test_key();
        let (prefixed_key, prefixed_fp) = test_key();
        std::fs::write(keys_dir.join("dev-plain"), &plain_key).unwrap();
        std::fs::write(
            keys_dir.join("dev-prefixed"),
            format!("dev-prefixed {prefixed_key}"),
        )
        .unwrap();
        std::fs::write(keys_dir.join("dev-bad"), "not a key").unwrap();

        let directory = MemoryDirectory::from_keys_dir(&keys_dir).unwrap();
        assert_eq!(
            directory.device("dev-plain").unwrap().key_fingerprint,
            plain_fp
        );
        assert_eq!(
            directory.device("dev-prefixed").unwrap().key_fingerprint,
            prefixed_fp
        );
        assert!(directory.device("dev-bad").is_none());

        let view = std::fs::read_to_string(tmp.path().join("authorized_keys")).unwrap();
        assert!(view.contains(plain_key.trim()));
        assert!(view.contains(prefixed_key.trim()));
    }

    #[test]
    fn test_connection_state_transitions() {
        let directory = MemoryDirectory::new();
        let (openssh, _) = test_key();
        directory.insert_device("dev-A", &openssh).unwrap();

        directory.set_connection_state("dev-A", true);
        assert_eq!(directory.device("dev-A").unwrap().status, DeviceStatus::Online);
        directory.set_connection_state("dev-A", false);
        assert_eq!(
            directory.device("dev-A").unwrap().status,
            DeviceStatus::Offline
        );
    }
}
