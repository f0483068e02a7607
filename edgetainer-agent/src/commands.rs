//! Command dispatch and the compose-backed runner.
//!
//! Commands arrive as envelopes on the control channel; each one maps to
//! a response envelope. Deployment-shaped commands shell out to the
//! `docker` CLI with one compose project directory per software ID.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use edgetainer_core::{
    Command, CommandEnvelope, CommandId, ContainerStatus, ResponseEnvelope, ResponseKind,
    TunnelError, TunnelResult,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::monitor::SystemMonitor;

/// Routes command envelopes to their handlers.
pub struct CommandDispatcher {
    runner: ComposeRunner,
    monitor: Arc<SystemMonitor>,
}

impl CommandDispatcher {
    pub fn new(runner: ComposeRunner, monitor: Arc<SystemMonitor>) -> Self {
        Self { runner, monitor }
    }

    pub fn runner(&self) -> &ComposeRunner {
        &self.runner
    }

    /// Whether a deployment is currently in flight.
    pub fn is_updating(&self) -> bool {
        self.runner.is_updating()
    }

    /// Handle one command, always producing a response envelope.
    pub async fn dispatch(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        let id = envelope.id;
        debug!(command = envelope.command.name(), command_id = %id, "Handling command");
        let result = match envelope.command {
            Command::Deploy {
                software_id,
                version,
                compose_config,
                env_vars,
            } => self
                .runner
                .deploy(&software_id, &version, &compose_config, &env_vars)
                .await
                .map(|_| {
                    ResponseEnvelope::success(
                        id,
                        ResponseKind::Success,
                        format!("deployed {software_id} {version}"),
                    )
                }),
            Command::Undeploy { software_id } => {
                self.runner.undeploy(&software_id).await.map(|_| {
                    ResponseEnvelope::success(
                        id,
                        ResponseKind::Success,
                        format!("removed {software_id}"),
                    )
                })
            }
            Command::UpdateEnvVar {
                software_id,
                env_vars,
            } => self
                .runner
                .update_env(&software_id, &env_vars)
                .await
                .map(|_| {
                    ResponseEnvelope::success(
                        id,
                        ResponseKind::Success,
                        format!("environment updated for {software_id}"),
                    )
                }),
            Command::Restart {
                software_id,
                container,
            } => self
                .runner
                .restart(&software_id, container.as_deref())
                .await
                .map(|_| {
                    ResponseEnvelope::success(
                        id,
                        ResponseKind::Success,
                        format!("restarted {software_id}"),
                    )
                }),
            Command::Execute { command, timeout } => self.execute(id, &command, timeout).await,
            Command::GetStatus {
                include_metrics,
                include_containers,
                include_system_stats,
            } => Ok(self
                .get_status(id, include_metrics, include_containers, include_system_stats)
                .await),
            Command::GetLogs {
                container,
                lines,
                follow,
            } => {
                if follow {
                    debug!(container, "Log following not supported over the envelope path");
                }
                self.runner.logs(&container, lines).await.map(|logs| {
                    ResponseEnvelope::success(id, ResponseKind::Logs, "")
                        .with_data("container", Value::from(container))
                        .with_data("logs", Value::from(logs))
                })
            }
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!(command_id = %id, error = %e, "Command failed");
                ResponseEnvelope::failure(id, e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        id: CommandId,
        command: &str,
        timeout: u64,
    ) -> TunnelResult<ResponseEnvelope> {
        let mut child = tokio::process::Command::new("sh");
        child.arg("-c").arg(command).kill_on_drop(true);

        let output = if timeout > 0 {
            tokio::time::timeout(Duration::from_secs(timeout), child.output())
                .await
                .map_err(|_| {
                    TunnelError::Timeout(format!("command exceeded {timeout}s"))
                })??
        } else {
            child.output().await?
        };

        Ok(ResponseEnvelope::success(id, ResponseKind::Output, "")
            .with_data(
                "exit_code",
                Value::from(output.status.code().unwrap_or(-1)),
            )
            .with_data(
                "stdout",
                Value::from(String::from_utf8_lossy(&output.stdout).into_owned()),
            )
            .with_data(
                "stderr",
                Value::from(String::from_utf8_lossy(&output.stderr).into_owned()),
            ))
    }

    /// Each flag selects its own data block: `include_metrics` the
    /// numeric samples, `include_system_stats` host/OS identity,
    /// `include_containers` the container table.
    async fn get_status(
        &self,
        id: CommandId,
        include_metrics: bool,
        include_containers: bool,
        include_system_stats: bool,
    ) -> ResponseEnvelope {
        let mut response = ResponseEnvelope::success(id, ResponseKind::Status, "");
        if include_metrics {
            response = response.with_data("metrics", Value::Object(self.monitor.snapshot()));
        }
        if include_system_stats {
            response = response.with_data("system", Value::Object(self.monitor.os_info()));
        }
        if include_containers {
            match self.runner.containers().await {
                Ok(containers) => {
                    response = response.with_data(
                        "containers",
                        serde_json::to_value(containers).unwrap_or_default(),
                    );
                }
                Err(e) => {
                    response = response.with_data("containers_error", Value::from(e.to_string()));
                }
            }
        }
        response
    }
}

/// Runs compose projects under one directory per software ID.
pub struct ComposeRunner {
    compose_dir: PathBuf,
    updating: AtomicBool,
    deployed: Mutex<HashMap<String, String>>,
}

impl ComposeRunner {
    pub fn new(compose_dir: PathBuf) -> Self {
        Self {
            compose_dir,
            updating: AtomicBool::new(false),
            deployed: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    /// Deployed software IDs and their versions.
    pub fn deployed(&self) -> HashMap<String, String> {
        self.deployed.lock().unwrap().clone()
    }

    pub async fn deploy(
        &self,
        software_id: &str,
        version: &str,
        compose_config: &str,
        env_vars: &HashMap<String, String>,
    ) -> TunnelResult<()> {
        let dir = self.app_dir(software_id)?;
        self.updating.store(true, Ordering::SeqCst);
        let result: TunnelResult<()> = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join("docker-compose.yml"), compose_config).await?;
            tokio::fs::write(dir.join(".env"), render_env_file(env_vars)).await?;
            self.compose(&dir, &["up", "-d", "--remove-orphans"]).await?;
            Ok(())
        }
        .await;
        self.updating.store(false, Ordering::SeqCst);
        result?;

        self.deployed
            .lock()
            .unwrap()
            .insert(software_id.to_string(), version.to_string());
        info!(software_id, version, "Deployment complete");
        Ok(())
    }

    pub async fn undeploy(&self, software_id: &str) -> TunnelResult<()> {
        let dir = self.app_dir(software_id)?;
        if !dir.exists() {
            return Err(TunnelError::Protocol(format!(
                "unknown software {software_id}"
            )));
        }
        self.compose(&dir, &["down", "--remove-orphans"]).await?;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(software_id, error = %e, "Could not remove project directory");
        }
        self.deployed.lock().unwrap().remove(software_id);
        info!(software_id, "Undeployed");
        Ok(())
    }

    pub async fn update_env(
        &self,
        software_id: &str,
        env_vars: &HashMap<String, String>,
    ) -> TunnelResult<()> {
        let dir = self.app_dir(software_id)?;
        let env_path = dir.join(".env");
        if !env_path.exists() {
            return Err(TunnelError::Protocol(format!(
                "unknown software {software_id}"
            )));
        }
        let existing = tokio::fs::read_to_string(&env_path).await?;
        let mut merged = parse_env_file(&existing);
        merged.extend(env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        tokio::fs::write(&env_path, render_env_file(&merged)).await?;
        self.compose(&dir, &["up", "-d"]).await?;
        info!(software_id, "Environment variables applied");
        Ok(())
    }

    pub async fn restart(&self, software_id: &str, container: Option<&str>) -> TunnelResult<()> {
        let dir = self.app_dir(software_id)?;
        if !dir.exists() {
            return Err(TunnelError::Protocol(format!(
                "unknown software {software_id}"
            )));
        }
        match container {
            Some(container) => self.compose(&dir, &["restart", container]).await?,
            None => self.compose(&dir, &["restart"]).await?,
        };
        Ok(())
    }

    pub async fn logs(&self, container: &str, lines: u32) -> TunnelResult<String> {
        let tail = lines.to_string();
        run_docker(&["logs", "--tail", &tail, container], None).await
    }

    /// Containers visible to the local daemon, for heartbeats and status.
    pub async fn containers(&self) -> TunnelResult<Vec<ContainerStatus>> {
        let output = run_docker(
            &[
                "ps",
                "--format",
                "{{.Names}}\t{{.Status}}\t{{.Image}}\t{{.CreatedAt}}",
            ],
            None,
        )
        .await?;
        Ok(parse_container_table(&output))
    }

    async fn compose(&self, dir: &Path, args: &[&str]) -> TunnelResult<String> {
        let mut full = vec!["compose"];
        full.extend_from_slice(args);
        run_docker(&full, Some(dir)).await
    }

    fn app_dir(&self, software_id: &str) -> TunnelResult<PathBuf> {
        let valid = !software_id.is_empty()
            && software_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !software_id.starts_with('.');
        if !valid {
            return Err(TunnelError::Protocol(format!(
                "invalid software ID {software_id:?}"
            )));
        }
        Ok(self.compose_dir.join(software_id))
    }
}

async fn run_docker(args: &[&str], cwd: Option<&Path>) -> TunnelResult<String> {
    let mut command = tokio::process::Command::new("docker");
    command.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command
        .output()
        .await
        .map_err(|e| TunnelError::Transport(format!("cannot run docker: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TunnelError::Device(format!(
            "docker {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Render env vars as a `.env` file, sorted for stable diffs.
fn render_env_file(vars: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        out.push_str(&vars[key]);
        out.push('\n');
    }
    out
}

fn parse_env_file(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

fn parse_container_table(output: &str) -> Vec<ContainerStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            Some(ContainerStatus {
                name: fields.next()?.to_string(),
                status: fields.next()?.to_string(),
                image: fields.next()?.to_string(),
                created: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> CommandDispatcher {
        let tmp = std::env::temp_dir().join("edgetainer-test-compose");
        CommandDispatcher::new(
            ComposeRunner::new(tmp),
            Arc::new(SystemMonitor::new()),
        )
    }

    #[test]
    fn test_env_file_roundtrip_is_sorted() {
        let vars = HashMap::from([
            ("ZEBRA".to_string(), "1".to_string()),
            ("ALPHA".to_string(), "two words".to_string()),
        ]);
        let rendered = render_env_file(&vars);
        assert_eq!(rendered, "ALPHA=two words\nZEBRA=1\n");
        assert_eq!(parse_env_file(&rendered), vars);
    }

    #[test]
    fn test_parse_env_file_skips_comments() {
        let parsed = parse_env_file("# comment\nKEY=value\nBROKEN LINE\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["KEY"], "value");
    }

    #[test]
    fn test_parse_container_table() {
        let output = "web\tUp 2 hours\tnginx:1.27\t2025-05-01 10:00:00\ndb\tExited (0)\tpostgres:16\t2025-05-01 09:00:00\n";
        let containers = parse_container_table(output);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "web");
        assert_eq!(containers[0].image, "nginx:1.27");
        assert_eq!(containers[1].status, "Exited (0)");
    }

    #[test]
    fn test_app_dir_rejects_traversal() {
        let runner = ComposeRunner::new(PathBuf::from("/var/lib/edgetainer"));
        assert!(runner.app_dir("../etc").is_err());
        assert!(runner.app_dir("a/b").is_err());
        assert!(runner.app_dir("").is_err());
        assert!(runner.app_dir(".hidden").is_err());
        assert!(runner.app_dir("web-frontend_v2.1").is_ok());
    }

    #[tokio::test]
    async fn test_execute_captures_output() {
        let dispatcher = dispatcher();
        let envelope = CommandEnvelope::new(Command::Execute {
            command: "echo hello; echo oops >&2; exit 3".into(),
            timeout: 10,
        });
        let response = dispatcher.dispatch(envelope).await;
        assert!(response.success);
        assert_eq!(response.kind, ResponseKind::Output);
        assert_eq!(response.data["exit_code"], 3);
        assert_eq!(response.data["stdout"], "hello\n");
        assert_eq!(response.data["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let dispatcher = dispatcher();
        let envelope = CommandEnvelope::new(Command::Execute {
            command: "sleep 5".into(),
            timeout: 1,
        });
        let response = dispatcher.dispatch(envelope).await;
        assert!(!response.success);
        assert!(response.message.contains("exceeded"));
    }

    #[tokio::test]
    async fn test_get_status_includes_metrics() {
        let dispatcher = dispatcher();
        let envelope = CommandEnvelope::new(Command::GetStatus {
            include_metrics: true,
            include_containers: false,
            include_system_stats: false,
        });
        let response = dispatcher.dispatch(envelope).await;
        assert!(response.success);
        assert_eq!(response.kind, ResponseKind::Status);
        assert!(response.data["metrics"]["memory_total_bytes"].is_u64());
        assert!(response.data["metrics"]["disks"].is_object());
        assert!(response.data.get("system").is_none());
    }

    #[tokio::test]
    async fn test_get_status_system_stats_are_independent() {
        let dispatcher = dispatcher();
        let envelope = CommandEnvelope::new(Command::GetStatus {
            include_metrics: false,
            include_containers: false,
            include_system_stats: true,
        });
        let response = dispatcher.dispatch(envelope).await;
        assert!(response.success);
        assert!(response.data.get("metrics").is_none());
        assert_eq!(response.data["system"]["arch"], std::env::consts::ARCH);
    }

    #[tokio::test]
    async fn test_unknown_software_rejected() {
        let dispatcher = dispatcher();
        let envelope = CommandEnvelope::new(Command::Restart {
            software_id: "never-deployed".into(),
            container: None,
        });
        let response = dispatcher.dispatch(envelope).await;
        assert!(!response.success);
        assert!(response.message.contains("unknown software"));
    }
}
