//! Reverse tunnel client.
//!
//! Keeps one always-on SSH connection to the management server, re-opening
//! it with exponential backoff when it drops. While connected the agent
//! opens a control channel for commands and heartbeats, registers its
//! reverse forwards and serves tunneled byte-streams to local ports.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use edgetainer_core::{
    ControlFrame, FrameCodec, FrameError, Heartbeat, HeartbeatStatus, ResponseEnvelope,
    TunnelError, TunnelResult, SHELL_FORWARD_TARGET,
};
use russh::client;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::commands::CommandDispatcher;
use crate::config::AgentConfig;
use crate::monitor::{local_ip, SystemMonitor};

/// Reconnect backoff: base 5s, doubling to a 5m cap.
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    CoolingDown,
    Stopped,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Idle => write!(f, "idle"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
            ConnState::CoolingDown => write!(f, "cooling-down"),
            ConnState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Exponential backoff ladder for the reconnect loop.
///
/// The delay doubles after every cooldown and only resets once a
/// connection has survived at least the cap.
#[derive(Debug)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
        }
    }

    /// Delay to sleep before the next attempt; advances the ladder.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    /// Report how long the last connection survived.
    pub fn connection_outcome(&mut self, connected_for: Duration) {
        if connected_for >= self.cap {
            self.next = self.base;
        }
    }

    /// The delay the next cooldown would use.
    pub fn current(&self) -> Duration {
        self.next
    }
}

/// The device tunnel client.
pub struct TunnelClient {
    config: Arc<AgentConfig>,
    dispatcher: Arc<CommandDispatcher>,
    monitor: Arc<SystemMonitor>,
    state: Mutex<ConnState>,
    current_backoff: Mutex<Duration>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Live session handle while connected; used for runtime forward
    /// requests.
    session: Mutex<Option<Arc<AsyncMutex<client::Handle<ClientHandler>>>>>,
    /// Sender feeding the control channel while connected.
    outbound: Mutex<Option<mpsc::Sender<ControlFrame>>>,
}

impl TunnelClient {
    pub fn new(
        config: Arc<AgentConfig>,
        dispatcher: Arc<CommandDispatcher>,
        monitor: Arc<SystemMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher,
            monitor,
            state: Mutex::new(ConnState::Idle),
            current_backoff: Mutex::new(BACKOFF_BASE),
            token: CancellationToken::new(),
            task: Mutex::new(None),
            session: Mutex::new(None),
            outbound: Mutex::new(None),
        })
    }

    /// Start the reconnect-capable connection loop. Returns immediately.
    pub fn connect(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move { client.run_loop().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Cancel the loop, close the connection and wait for cleanup.
    pub async fn disconnect(&self) {
        self.token.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// The backoff the next cooldown would apply; observable for tests
    /// and logs.
    pub fn current_backoff(&self) -> Duration {
        *self.current_backoff.lock().unwrap()
    }

    /// Ask the server to expose `target_local_port` of this device
    /// through a server-side listener.
    pub async fn open_reverse_forward(&self, target_local_port: u16) -> TunnelResult<()> {
        let handle = self.session.lock().unwrap().clone();
        let Some(handle) = handle else {
            return Err(TunnelError::NotConnected("tunnel is down".into()));
        };
        let result = handle
            .lock()
            .await
            .tcpip_forward("127.0.0.1", u32::from(target_local_port))
            .await;
        result
            .map(|_| ())
            .map_err(|e| TunnelError::Transport(format!("forward request failed: {e}")))
    }

    /// Send an out-of-cycle heartbeat.
    pub async fn send_heartbeat(
        &self,
        status: HeartbeatStatus,
        metrics: Option<serde_json::Map<String, Value>>,
        containers: Option<Vec<edgetainer_core::ContainerStatus>>,
    ) -> TunnelResult<()> {
        let sender = self.outbound.lock().unwrap().clone();
        let Some(sender) = sender else {
            return Err(TunnelError::NotConnected("tunnel is down".into()));
        };
        let mut heartbeat = Heartbeat::new(&self.config.device_id, status);
        heartbeat.ip = local_ip().unwrap_or_default();
        heartbeat.version = env!("CARGO_PKG_VERSION").to_string();
        heartbeat.metrics = metrics;
        heartbeat.containers = containers;
        sender
            .send(ControlFrame::Heartbeat(heartbeat))
            .await
            .map_err(|_| TunnelError::NotConnected("tunnel is down".into()))
    }

    fn set_state(&self, state: ConnState) {
        let mut current = self.state.lock().unwrap();
        if *current != state {
            debug!(from = %*current, to = %state, "Connection state change");
            *current = state;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let mut policy = ReconnectPolicy::new(BACKOFF_BASE, BACKOFF_CAP);
        loop {
            if self.token.is_cancelled() {
                break;
            }
            self.set_state(ConnState::Connecting);
            match self.run_session().await {
                Ok(connected_for) => {
                    policy.connection_outcome(connected_for);
                    info!(?connected_for, "Connection lost");
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                }
            }
            if self.token.is_cancelled() {
                break;
            }

            let delay = policy.next_delay();
            *self.current_backoff.lock().unwrap() = policy.current();
            self.set_state(ConnState::CoolingDown);
            info!(?delay, "Reconnecting after cooldown");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.token.cancelled() => break,
            }
            self.set_state(ConnState::Idle);
        }
        self.set_state(ConnState::Stopped);
        debug!("Connection loop stopped");
    }

    /// One connection attempt: handshake, auth, forwards, control loop.
    /// Returns how long the session stayed connected.
    async fn run_session(&self) -> TunnelResult<Duration> {
        let (host, port) = self.config.server_addr();
        info!(host, port, "Connecting to tunnel server");

        let key = russh::keys::load_secret_key(&self.config.key_path, None).map_err(|e| {
            TunnelError::Config(format!(
                "cannot load device key {}: {e}",
                self.config.key_path.display()
            ))
        })?;

        let keepalive = self.config.keepalive_interval.max(1);
        let keepalive_max =
            (self.config.keepalive_timeout / keepalive).max(1) as usize;
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(keepalive)),
            keepalive_max,
            ..Default::default()
        });

        let handler = ClientHandler {
            pinned_fingerprint: self.config.server_fingerprint.clone(),
            local_ssh_port: self.config.local_ssh_port,
        };
        let mut session = client::connect(ssh_config, (host.as_str(), port), handler)
            .await
            .map_err(|e| TunnelError::Transport(format!("connect failed: {e}")))?;

        let best_hash = session
            .best_supported_rsa_hash()
            .await
            .map_err(|e| TunnelError::Transport(e.to_string()))?
            .flatten();
        let auth = session
            .authenticate_publickey(
                self.config.device_id.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), best_hash),
            )
            .await
            .map_err(|e| TunnelError::Transport(format!("authentication errored: {e}")))?;
        if !auth.success() {
            return Err(TunnelError::Auth(
                "server rejected device credentials".into(),
            ));
        }
        info!(device_id = %self.config.device_id, "Authenticated with tunnel server");

        let control = session
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Transport(format!("control channel open failed: {e}")))?;

        // Shell forward first so the operator-facing port comes up before
        // anything else, then the extra service forwards.
        session
            .tcpip_forward("127.0.0.1", SHELL_FORWARD_TARGET)
            .await
            .map_err(|e| TunnelError::Transport(format!("shell forward refused: {e}")))?;
        for forward_port in &self.config.forward_ports {
            if let Err(e) = session
                .tcpip_forward("127.0.0.1", u32::from(*forward_port))
                .await
            {
                warn!(port = forward_port, error = %e, "Forward request failed");
            }
        }

        let session = Arc::new(AsyncMutex::new(session));
        *self.session.lock().unwrap() = Some(Arc::clone(&session));
        self.set_state(ConnState::Connected);
        let connected_at = Instant::now();
        info!("Tunnel established");

        self.drive_control_channel(control).await;

        self.session.lock().unwrap().take();
        self.outbound.lock().unwrap().take();
        let _ = session
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "agent closing", "")
            .await;
        Ok(connected_at.elapsed())
    }

    /// Pump the control channel until it closes: outbound heartbeats and
    /// command responses, inbound command envelopes.
    async fn drive_control_channel(&self, mut channel: Channel<client::Msg>) {
        let mut codec = FrameCodec::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlFrame>(32);
        *self.outbound.lock().unwrap() = Some(outbound_tx.clone());

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = channel.eof().await;
                    return;
                }
                _ = heartbeat.tick() => {
                    let frame = ControlFrame::Heartbeat(self.build_heartbeat().await);
                    match frame.to_line() {
                        Ok(line) => {
                            if channel.data(line.as_bytes()).await.is_err() {
                                warn!("Heartbeat write failed");
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Heartbeat serialization failed"),
                    }
                }
                Some(frame) = outbound_rx.recv() => {
                    match frame.to_line() {
                        Ok(line) => {
                            if channel.data(line.as_bytes()).await.is_err() {
                                warn!("Control channel write failed");
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Frame serialization failed"),
                    }
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        codec.extend(&data);
                        while let Some(frame) = codec.next_frame() {
                            self.handle_frame(frame, &outbound_tx);
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                        info!("Control channel closed by server");
                        return;
                    }
                    None => {
                        info!("Connection closed");
                        return;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn handle_frame(
        &self,
        frame: Result<ControlFrame, FrameError>,
        outbound: &mpsc::Sender<ControlFrame>,
    ) {
        match frame {
            Ok(ControlFrame::Command(envelope)) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let tx = outbound.clone();
                tokio::spawn(async move {
                    let response = dispatcher.dispatch(envelope).await;
                    let _ = tx.send(ControlFrame::Response(response)).await;
                });
            }
            Ok(_) => {
                debug!("Ignoring non-command frame from server");
            }
            Err(e) => {
                warn!(error = %e, "Bad control frame");
                if let Some(response) = protocol_error_response(&e) {
                    let tx = outbound.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(ControlFrame::Response(response)).await;
                    });
                }
            }
        }
    }

    async fn build_heartbeat(&self) -> Heartbeat {
        let status = if self.dispatcher.is_updating() {
            HeartbeatStatus::Updating
        } else {
            HeartbeatStatus::Ok
        };
        let mut heartbeat = Heartbeat::new(&self.config.device_id, status);
        heartbeat.ip = local_ip().unwrap_or_default();
        heartbeat.version = env!("CARGO_PKG_VERSION").to_string();
        heartbeat.metrics = Some(self.monitor.snapshot());
        heartbeat.containers = self.dispatcher.runner().containers().await.ok();
        heartbeat
    }
}

/// Build a `success: false` protocol-error reply for a malformed command
/// frame, when the envelope ID can still be recovered.
fn protocol_error_response(error: &FrameError) -> Option<ResponseEnvelope> {
    let FrameError::Malformed { line, .. } = error else {
        return None;
    };
    let value: Value = serde_json::from_str(line).ok()?;
    let id = value.get("id")?.as_str()?.parse().ok()?;
    Some(ResponseEnvelope::failure(
        edgetainer_core::CommandId(id),
        "protocol error: unknown or malformed command",
    ))
}

struct ClientHandler {
    pinned_fingerprint: Option<String>,
    local_ssh_port: u16,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        match &self.pinned_fingerprint {
            // The fingerprint is accepted out-of-band at provisioning.
            None => Ok(true),
            Some(pinned) => {
                let offered = server_key.fingerprint(HashAlg::Sha256).to_string();
                if &offered == pinned {
                    Ok(true)
                } else {
                    warn!(offered, pinned, "Server host key mismatch");
                    Ok(false)
                }
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let target = if connected_port == SHELL_FORWARD_TARGET {
            self.local_ssh_port
        } else {
            match u16::try_from(connected_port) {
                Ok(port) => port,
                Err(_) => {
                    debug!(connected_port, "Rejecting channel to out-of-range port");
                    return Ok(());
                }
            }
        };
        debug!(
            target,
            originator_address, originator_port, "Serving tunneled connection"
        );
        tokio::spawn(async move {
            match TcpStream::connect(("127.0.0.1", target)).await {
                Ok(mut local) => {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut local, &mut stream).await;
                }
                Err(e) => {
                    // Nothing listening on the target; dropping the
                    // channel closes it toward the server.
                    debug!(target, error = %e, "Local dial failed");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetainer_core::{Command, CommandEnvelope};

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut policy = ReconnectPolicy::new(BACKOFF_BASE, BACKOFF_CAP);
        assert_eq!(policy.next_delay(), Duration::from_secs(5));
        assert_eq!(policy.next_delay(), Duration::from_secs(10));
        assert_eq!(policy.next_delay(), Duration::from_secs(20));
        for _ in 0..10 {
            policy.next_delay();
        }
        assert_eq!(policy.next_delay(), BACKOFF_CAP);
        assert_eq!(policy.next_delay(), BACKOFF_CAP);
    }

    #[test]
    fn test_backoff_resets_only_after_sustained_connection() {
        let mut policy = ReconnectPolicy::new(BACKOFF_BASE, BACKOFF_CAP);
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.current(), Duration::from_secs(20));

        // A short-lived connection keeps the ladder where it was.
        policy.connection_outcome(Duration::from_secs(30));
        assert_eq!(policy.current(), Duration::from_secs(20));

        // Surviving past the cap resets to base.
        policy.connection_outcome(BACKOFF_CAP + Duration::from_secs(1));
        assert_eq!(policy.current(), BACKOFF_BASE);
        assert_eq!(policy.next_delay(), BACKOFF_BASE);
    }

    #[test]
    fn test_protocol_error_reply_recovers_envelope_id() {
        let raw = r#"{"id":"0a0f5e5e-0000-4000-8000-000000000001","type":"self_destruct","timestamp":"2025-01-01T00:00:00Z","payload":{}}"#;
        let error = FrameError::Malformed {
            source: serde_json::from_str::<CommandEnvelope>(raw).unwrap_err(),
            line: raw.to_string(),
        };
        let response = protocol_error_response(&error).unwrap();
        assert!(!response.success);
        assert_eq!(
            response.command_id.to_string(),
            "0a0f5e5e-0000-4000-8000-000000000001"
        );
        assert!(response.message.contains("protocol error"));
    }

    #[test]
    fn test_protocol_error_reply_needs_an_id() {
        let error = FrameError::Malformed {
            source: serde_json::from_str::<CommandEnvelope>("{}").unwrap_err(),
            line: "{}".to_string(),
        };
        assert!(protocol_error_response(&error).is_none());

        let valid = CommandEnvelope::new(Command::Undeploy {
            software_id: "x".into(),
        });
        // A well-formed envelope never reaches the error path.
        assert!(serde_json::to_string(&valid).is_ok());
    }
}
