//! System metrics for heartbeats and status queries.

use std::sync::Mutex;

use serde_json::{Map, Value};
use sysinfo::{Disks, System};

/// Samples host metrics on demand.
pub struct SystemMonitor {
    sys: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
        }
    }

    /// Current metrics as the JSON object carried in heartbeats.
    pub fn snapshot(&self) -> Map<String, Value> {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let load = System::load_average();
        let mut metrics = Map::new();
        metrics.insert(
            "cpu_percent".into(),
            Value::from(f64::from(sys.global_cpu_usage())),
        );
        metrics.insert("memory_used_bytes".into(), Value::from(sys.used_memory()));
        metrics.insert("memory_total_bytes".into(), Value::from(sys.total_memory()));
        metrics.insert("load_1".into(), Value::from(load.one));
        metrics.insert("load_5".into(), Value::from(load.five));
        metrics.insert("load_15".into(), Value::from(load.fifteen));
        metrics.insert("uptime_seconds".into(), Value::from(System::uptime()));
        metrics.insert("disks".into(), Value::Object(disk_snapshot()));
        metrics
    }

    /// Host and OS identity, reported separately from the numeric
    /// metrics when a status query asks for system stats.
    pub fn os_info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        if let Some(hostname) = System::host_name() {
            info.insert("hostname".into(), Value::from(hostname));
        }
        if let Some(os) = System::name() {
            info.insert("os".into(), Value::from(os));
        }
        if let Some(os_version) = System::os_version() {
            info.insert("os_version".into(), Value::from(os_version));
        }
        if let Some(kernel) = System::kernel_version() {
            info.insert("kernel_version".into(), Value::from(kernel));
        }
        info.insert("arch".into(), Value::from(std::env::consts::ARCH));
        info
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-mountpoint disk usage.
fn disk_snapshot() -> Map<String, Value> {
    let disks = Disks::new_with_refreshed_list();
    let mut snapshot = Map::new();
    for disk in disks.list() {
        let total = disk.total_space();
        let free = disk.available_space();
        let usage_percent = if total > 0 {
            (total - free.min(total)) as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let mut entry = Map::new();
        entry.insert("disk_total_bytes".into(), Value::from(total));
        entry.insert("disk_free_bytes".into(), Value::from(free));
        entry.insert("disk_usage_percent".into(), Value::from(usage_percent));
        snapshot.insert(disk.mount_point().to_string_lossy().into_owned(), Value::Object(entry));
    }
    snapshot
}

/// Best-effort non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket performs a route lookup without sending any
/// packet, so this works offline as long as a default route exists.
pub fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_has_expected_fields() {
        let monitor = SystemMonitor::new();
        let metrics = monitor.snapshot();
        for key in [
            "cpu_percent",
            "memory_used_bytes",
            "memory_total_bytes",
            "uptime_seconds",
            "disks",
        ] {
            assert!(metrics.contains_key(key), "missing {key}");
        }
        let used = metrics["memory_used_bytes"].as_u64().unwrap();
        let total = metrics["memory_total_bytes"].as_u64().unwrap();
        assert!(total >= used);

        // Every reported mount point carries the full usage triple.
        for (mount, entry) in metrics["disks"].as_object().unwrap() {
            let entry = entry.as_object().unwrap();
            for key in ["disk_total_bytes", "disk_free_bytes", "disk_usage_percent"] {
                assert!(entry.contains_key(key), "missing {key} for {mount}");
            }
            let percent = entry["disk_usage_percent"].as_f64().unwrap();
            assert!((0.0..=100.0).contains(&percent));
        }
    }

    #[test]
    fn test_os_info_reports_arch() {
        let monitor = SystemMonitor::new();
        let info = monitor.os_info();
        assert_eq!(info["arch"], std::env::consts::ARCH);
    }

    #[test]
    fn test_local_ip_is_well_formed_when_present() {
        if let Some(ip) = local_ip() {
            assert!(ip.parse::<std::net::IpAddr>().is_ok());
        }
    }
}
