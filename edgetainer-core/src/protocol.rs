//! Wire protocol for the device tunnel.
//!
//! The transport is SSH; on top of it, the server and agent exchange
//! newline-delimited JSON frames over a single control channel: command
//! envelopes (server to agent), response envelopes (agent to server) and
//! heartbeats (agent to server, fire-and-forget).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default TCP port the tunnel server listens on.
pub const DEFAULT_SSH_PORT: u16 = 2222;
/// Default lower bound of the reverse-forward port range (inclusive).
pub const DEFAULT_START_PORT: u16 = 10000;
/// Default upper bound of the reverse-forward port range (inclusive).
pub const DEFAULT_END_PORT: u16 = 20000;

/// Target port value designating the device's SSH daemon in a
/// `tcpip-forward` request. The agent resolves it to its configured local
/// sshd port; the server binds it to the device's pinned shell port.
pub const SHELL_FORWARD_TARGET: u32 = 0;

/// Largest accepted control-channel frame, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Unique identifier correlating a command with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    /// Generate a new random command ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A command sent from the server to a device, tagged by type.
///
/// On the wire this serializes as `"type": "<cmd>"` plus a type-specific
/// `"payload"` object. Unknown types fail deserialization and are answered
/// with a protocol-error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        software_id: String,
        version: String,
        compose_config: String,
        #[serde(default)]
        env_vars: HashMap<String, String>,
    },
    Undeploy {
        software_id: String,
    },
    UpdateEnvVar {
        software_id: String,
        env_vars: HashMap<String, String>,
    },
    Restart {
        software_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },
    Execute {
        command: String,
        /// Timeout in seconds; 0 means none.
        #[serde(default)]
        timeout: u64,
    },
    GetStatus {
        #[serde(default)]
        include_metrics: bool,
        #[serde(default)]
        include_containers: bool,
        #[serde(default)]
        include_system_stats: bool,
    },
    GetLogs {
        container: String,
        lines: u32,
        #[serde(default)]
        follow: bool,
    },
}

impl Command {
    /// The wire name of this command type.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Deploy { .. } => "deploy",
            Command::Undeploy { .. } => "undeploy",
            Command::UpdateEnvVar { .. } => "update_env_var",
            Command::Restart { .. } => "restart",
            Command::Execute { .. } => "execute",
            Command::GetStatus { .. } => "get_status",
            Command::GetLogs { .. } => "get_logs",
        }
    }
}

/// Command envelope carried on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: CommandId,
    #[serde(flatten)]
    pub command: Command,
    pub timestamp: DateTime<Utc>,
}

impl CommandEnvelope {
    /// Wrap a command with a fresh ID and the current timestamp.
    pub fn new(command: Command) -> Self {
        Self {
            id: CommandId::new(),
            command,
            timestamp: Utc::now(),
        }
    }
}

/// Response category reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Success,
    Error,
    Status,
    Logs,
    Output,
}

/// Response envelope correlating back to a command by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub command_id: CommandId,
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ResponseEnvelope {
    /// Create a successful response.
    pub fn success(command_id: CommandId, kind: ResponseKind, message: impl Into<String>) -> Self {
        Self {
            command_id,
            kind,
            timestamp: Utc::now(),
            success: true,
            message: message.into(),
            data: Map::new(),
        }
    }

    /// Create a failure response.
    pub fn failure(command_id: CommandId, message: impl Into<String>) -> Self {
        Self {
            command_id,
            kind: ResponseKind::Error,
            timestamp: Utc::now(),
            success: false,
            message: message.into(),
            data: Map::new(),
        }
    }

    /// Attach a data field.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Device status reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Ok,
    Updating,
    Error,
}

impl std::fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatStatus::Ok => write!(f, "ok"),
            HeartbeatStatus::Updating => write!(f, "updating"),
            HeartbeatStatus::Error => write!(f, "error"),
        }
    }
}

/// Status of one container running on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub status: String,
    pub image: String,
    pub created: String,
}

/// Periodic check-in message from the agent.
///
/// Heartbeats may arrive out of order; receivers keep the largest
/// observed timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub status: HeartbeatStatus,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerStatus>>,
}

impl Heartbeat {
    /// Create a heartbeat with the current timestamp and no optional fields.
    pub fn new(device_id: impl Into<String>, status: HeartbeatStatus) -> Self {
        Self {
            device_id: device_id.into(),
            status,
            timestamp: Utc::now(),
            ip: String::new(),
            version: String::new(),
            metrics: None,
            containers: None,
        }
    }
}

/// One control-channel frame.
///
/// Discrimination is structural: a command carries `id` + `payload`, a
/// response carries `command_id` + `success`, a heartbeat carries
/// `device_id` + `status`. The serialized shapes are therefore exactly the
/// bare envelopes, with no extra tag field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlFrame {
    Command(CommandEnvelope),
    Response(ResponseEnvelope),
    Heartbeat(Heartbeat),
}

impl ControlFrame {
    /// Serialize to a newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Deserialize from one JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Errors produced while decoding control frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The line was not a valid frame. Carries the offending line so the
    /// receiver can still correlate a protocol-error reply by envelope ID.
    #[error("malformed control frame: {source}")]
    Malformed {
        source: serde_json::Error,
        line: String,
    },
    #[error("control frame exceeds {MAX_FRAME_LEN} bytes")]
    Oversized,
}

/// Incremental decoder for newline-delimited control frames.
///
/// SSH delivers channel data in arbitrary chunks; the codec buffers bytes
/// until a full line is available. Oversized frames are dropped and
/// reported rather than growing the buffer without bound.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
    overflowed: bool,
}

impl FrameCodec {
    /// Create an empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw channel bytes.
    pub fn extend(&mut self, data: &[u8]) {
        if self.overflowed {
            // Discard until the end of the oversized line.
            if let Some(pos) = data.iter().position(|&b| b == b'\n') {
                self.overflowed = false;
                self.buf.clear();
                self.buf.extend_from_slice(&data[pos + 1..]);
            }
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Result<ControlFrame, FrameError>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..pos]);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                return Some(ControlFrame::from_line(trimmed).map_err(|e| {
                    FrameError::Malformed {
                        source: e,
                        line: trimmed.to_string(),
                    }
                }));
            }
            if self.buf.len() > MAX_FRAME_LEN {
                self.buf.clear();
                self.overflowed = true;
                return Some(Err(FrameError::Oversized));
            }
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope_wire_shape() {
        let envelope = CommandEnvelope::new(Command::Deploy {
            software_id: "web-frontend".to_string(),
            version: "1.4.2".to_string(),
            compose_config: "services: {}".to_string(),
            env_vars: HashMap::from([("PORT".to_string(), "8080".to_string())]),
        });

        let value: Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "deploy");
        assert_eq!(value["payload"]["software_id"], "web-frontend");
        assert_eq!(value["payload"]["env_vars"]["PORT"], "8080");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_command_type_names() {
        let cases = [
            (
                Command::Undeploy {
                    software_id: "x".into(),
                },
                "undeploy",
            ),
            (
                Command::UpdateEnvVar {
                    software_id: "x".into(),
                    env_vars: HashMap::new(),
                },
                "update_env_var",
            ),
            (
                Command::GetStatus {
                    include_metrics: true,
                    include_containers: false,
                    include_system_stats: false,
                },
                "get_status",
            ),
        ];
        for (cmd, name) in cases {
            assert_eq!(cmd.name(), name);
            let value = serde_json::to_value(CommandEnvelope::new(cmd)).unwrap();
            assert_eq!(value["type"], name);
        }
    }

    #[test]
    fn test_unknown_command_type_rejected() {
        let raw = r#"{"id":"6a5e36a4-9c13-4b2a-a9ee-111111111111","type":"reboot","timestamp":"2025-01-01T00:00:00Z","payload":{}}"#;
        assert!(serde_json::from_str::<CommandEnvelope>(raw).is_err());
    }

    #[test]
    fn test_response_roundtrip() {
        let id = CommandId::new();
        let resp = ResponseEnvelope::success(id, ResponseKind::Output, "done")
            .with_data("exit_code", Value::from(0));
        let line = ControlFrame::Response(resp).to_line().unwrap();
        match ControlFrame::from_line(line.trim()).unwrap() {
            ControlFrame::Response(decoded) => {
                assert_eq!(decoded.command_id, id);
                assert!(decoded.success);
                assert_eq!(decoded.data["exit_code"], 0);
            }
            other => panic!("decoded as {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_omits_empty_optionals() {
        let hb = Heartbeat::new("dev-A", HeartbeatStatus::Ok);
        let value = serde_json::to_value(&hb).unwrap();
        assert_eq!(value["status"], "ok");
        assert!(value.get("metrics").is_none());
        assert!(value.get("containers").is_none());
    }

    #[test]
    fn test_frame_discrimination() {
        let command = ControlFrame::Command(CommandEnvelope::new(Command::Execute {
            command: "uptime".into(),
            timeout: 5,
        }))
        .to_line()
        .unwrap();
        let heartbeat = ControlFrame::Heartbeat(Heartbeat::new("dev-A", HeartbeatStatus::Updating))
            .to_line()
            .unwrap();

        assert!(matches!(
            ControlFrame::from_line(command.trim()).unwrap(),
            ControlFrame::Command(_)
        ));
        assert!(matches!(
            ControlFrame::from_line(heartbeat.trim()).unwrap(),
            ControlFrame::Heartbeat(_)
        ));
    }

    #[test]
    fn test_codec_reassembles_split_frames() {
        let mut codec = FrameCodec::new();
        let line = ControlFrame::Heartbeat(Heartbeat::new("dev-A", HeartbeatStatus::Ok))
            .to_line()
            .unwrap();
        let bytes = line.as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        codec.extend(head);
        assert!(codec.next_frame().is_none());
        codec.extend(tail);
        match codec.next_frame() {
            Some(Ok(ControlFrame::Heartbeat(hb))) => assert_eq!(hb.device_id, "dev-A"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(codec.next_frame().is_none());
    }

    #[test]
    fn test_codec_recovers_after_malformed_line() {
        let mut codec = FrameCodec::new();
        codec.extend(b"not json\n");
        assert!(matches!(codec.next_frame(), Some(Err(_))));

        let line = ControlFrame::Heartbeat(Heartbeat::new("dev-B", HeartbeatStatus::Ok))
            .to_line()
            .unwrap();
        codec.extend(line.as_bytes());
        assert!(matches!(
            codec.next_frame(),
            Some(Ok(ControlFrame::Heartbeat(_)))
        ));
    }

    #[test]
    fn test_codec_oversized_frame() {
        let mut codec = FrameCodec::new();
        codec.extend(&vec![b'x'; MAX_FRAME_LEN + 1]);
        assert!(matches!(
            codec.next_frame(),
            Some(Err(FrameError::Oversized))
        ));

        // The rest of the oversized line is discarded; the next line parses.
        let line = ControlFrame::Heartbeat(Heartbeat::new("dev-C", HeartbeatStatus::Ok))
            .to_line()
            .unwrap();
        let mut data = b"yyy\n".to_vec();
        data.extend_from_slice(line.as_bytes());
        codec.extend(&data);
        assert!(matches!(
            codec.next_frame(),
            Some(Ok(ControlFrame::Heartbeat(_)))
        ));
    }
}
