//! SSH tunnel endpoint: live connections, port forwards, command dispatch.
//!
//! One [`LiveConnection`] exists per authenticated device at any time; a
//! second successful handshake for the same device ID supersedes the
//! first. The prior connection is fully closed before the new one becomes
//! visible to readers of the registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use edgetainer_core::{
    Command, CommandEnvelope, CommandId, ControlFrame, Heartbeat, ResponseEnvelope, TunnelError,
    TunnelResult, SHELL_FORWARD_TARGET,
};
use russh::keys::{HashAlg, PublicKey};
use russh::server::Msg;
use russh::{ChannelId, ChannelStream, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broker::PortBroker;
use crate::config::ServerConfig;
use crate::directory::{DeviceDirectory, DeviceRecord};
use crate::handler::{InstalledSlot, ServerHandler};
use crate::hostkey;

/// Commands awaiting their response from a device.
///
/// Each dispatched command registers a oneshot slot keyed by command ID;
/// the control-channel reader resolves it when the reply arrives. A slot
/// discarded on deadline expiry makes the eventual late reply a no-op.
pub(crate) struct PendingCommands {
    slots: DashMap<CommandId, oneshot::Sender<ResponseEnvelope>>,
}

impl PendingCommands {
    fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, id: CommandId) -> oneshot::Receiver<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        rx
    }

    pub(crate) fn discard(&self, id: CommandId) {
        self.slots.remove(&id);
    }

    /// Deliver a response to its waiting slot. Returns `false` when no
    /// slot exists (late reply after a timeout, or unknown ID).
    pub(crate) fn resolve(&self, response: ResponseEnvelope) -> bool {
        match self.slots.remove(&response.command_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

struct ForwardEntry {
    target: u32,
    shell: bool,
    task: JoinHandle<()>,
}

/// An accepted, authenticated multiplex to one device.
pub struct LiveConnection {
    pub device_id: String,
    pub peer: SocketAddr,
    pub established_at: DateTime<Utc>,
    /// Shell port pinned to this device, claimed in the broker for the
    /// lifetime of the connection (and across supersession).
    pub shell_port: Option<u16>,
    handle: russh::server::Handle,
    control: Mutex<Option<ChannelId>>,
    pending: PendingCommands,
    /// server port → active reverse forward.
    forwards: Mutex<HashMap<u16, ForwardEntry>>,
}

impl LiveConnection {
    fn new(
        device_id: &str,
        peer: SocketAddr,
        handle: russh::server::Handle,
        shell_port: Option<u16>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            peer,
            established_at: Utc::now(),
            shell_port,
            handle,
            control: Mutex::new(None),
            pending: PendingCommands::new(),
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Record the device's control channel. The first session channel
    /// wins; later ones are plain session channels.
    pub(crate) fn set_control(&self, channel: ChannelId) -> bool {
        let mut control = self.control.lock().unwrap();
        if control.is_none() {
            *control = Some(channel);
            true
        } else {
            false
        }
    }

    pub(crate) fn control_channel(&self) -> Option<ChannelId> {
        *self.control.lock().unwrap()
    }

    pub(crate) fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    /// Issue a command on the control channel and await its reply.
    pub async fn send_command(
        &self,
        command: Command,
        deadline: Duration,
    ) -> TunnelResult<ResponseEnvelope> {
        let Some(control) = self.control_channel() else {
            return Err(TunnelError::NotConnected(format!(
                "{} has not opened its control channel",
                self.device_id
            )));
        };
        let envelope = CommandEnvelope::new(command);
        let id = envelope.id;
        debug!(
            device_id = %self.device_id,
            command = envelope.command.name(),
            command_id = %id,
            "Dispatching command"
        );
        let line = ControlFrame::Command(envelope).to_line()?;
        let rx = self.pending.register(id);
        if self
            .handle
            .data(control, CryptoVec::from(line.into_bytes()))
            .await
            .is_err()
        {
            self.pending.discard(id);
            return Err(TunnelError::Transport(
                "control channel write failed".into(),
            ));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => {
                if response.success {
                    Ok(response)
                } else {
                    Err(TunnelError::Device(response.message))
                }
            }
            Ok(Err(_)) => Err(TunnelError::Transport(
                "connection closed while awaiting reply".into(),
            )),
            Err(_) => {
                // Unlink the slot so the late reply is discarded.
                self.pending.discard(id);
                Err(TunnelError::Timeout(format!(
                    "command {id} unanswered after {deadline:?}"
                )))
            }
        }
    }

    /// Open a byte-stream to `127.0.0.1:target` on the device.
    pub async fn open_stream(
        &self,
        target: u32,
        originator: &str,
        originator_port: u32,
    ) -> TunnelResult<ChannelStream<Msg>> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                "127.0.0.1".to_string(),
                target,
                originator.to_string(),
                originator_port,
            )
            .await
            .map_err(|e| TunnelError::Transport(format!("channel open refused: {e}")))?;
        Ok(channel.into_stream())
    }

    fn add_forward(&self, server_port: u16, entry: ForwardEntry) {
        self.forwards.lock().unwrap().insert(server_port, entry);
    }

    fn has_forward(&self, server_port: u16) -> bool {
        self.forwards.lock().unwrap().contains_key(&server_port)
    }

    fn remove_forward_by_target(&self, target: u32) -> Option<(u16, ForwardEntry)> {
        let mut forwards = self.forwards.lock().unwrap();
        let port = forwards
            .iter()
            .find(|(_, entry)| entry.target == target)
            .map(|(port, _)| *port)?;
        forwards.remove(&port).map(|entry| (port, entry))
    }

    /// Stop every forward listener and report which ports to release.
    /// When `keep_shell` is set the pinned shell port stays claimed so a
    /// superseding connection inherits it without a trip through the pool.
    async fn shutdown_forwards(&self, keep_shell: bool) -> Vec<u16> {
        let entries: Vec<(u16, ForwardEntry)> =
            self.forwards.lock().unwrap().drain().collect();
        let mut released = Vec::new();
        for (port, entry) in entries {
            entry.task.abort();
            let _ = entry.task.await;
            if !(keep_shell && entry.shell) {
                released.push(port);
            }
        }
        released
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .handle
            .disconnect(
                russh::Disconnect::ByApplication,
                reason.to_string(),
                String::new(),
            )
            .await;
    }
}

/// Why an authentication attempt was rejected. Logged server-side only;
/// the peer sees a bare failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthRejection {
    UnknownDevice,
    KeyMismatch,
    Disabled,
}

impl AuthRejection {
    pub(crate) fn category(&self) -> &'static str {
        match self {
            AuthRejection::UnknownDevice => "unknown-device",
            AuthRejection::KeyMismatch => "bad-key",
            AuthRejection::Disabled => "device-disabled",
        }
    }
}

/// The server tunnel endpoint.
pub struct TunnelServer {
    pub(crate) config: ServerConfig,
    pub(crate) directory: Arc<dyn DeviceDirectory>,
    pub(crate) broker: PortBroker,
    connections: Mutex<HashMap<String, Arc<LiveConnection>>>,
    token: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, directory: Arc<dyn DeviceDirectory>) -> Arc<Self> {
        let broker = PortBroker::new(config.start_port, config.end_port);
        Arc::new(Self {
            config,
            directory,
            broker,
            connections: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind the SSH listener and start accepting device connections.
    pub async fn start(self: &Arc<Self>) -> TunnelResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::Config("tunnel server already started".into()));
        }

        let host_key = hostkey::ensure_host_key(&self.config.host_key_path).await?;
        let keepalive = Duration::from_secs(self.config.keepalive_interval.max(1));
        let keepalive_max =
            (self.config.keepalive_timeout / self.config.keepalive_interval.max(1)).max(1) as usize;
        let ssh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(keepalive),
            keepalive_max,
            keys: vec![host_key],
            ..Default::default()
        });

        let addr = self.config.ssh_listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::Config(format!("cannot bind SSH listener on {addr}: {e}")))?;
        info!(%addr, "SSH tunnel server listening");

        let server = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = server.token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            server.spawn_connection(stream, peer, Arc::clone(&ssh_config));
                        }
                        Err(e) => {
                            // Accept-storm guard for transient OS errors.
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            debug!("SSH accept loop stopped");
        });
        Ok(())
    }

    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<russh::server::Config>,
    ) {
        let server = Arc::clone(self);
        let slot: InstalledSlot = Arc::new(Mutex::new(None));
        let handler = ServerHandler::new(Arc::clone(&server), peer, Arc::clone(&slot));
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let mut session = match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(e) => {
                    info!(%peer, category = "protocol-error", error = %e, "SSH handshake failed");
                    return;
                }
            };
            tokio::select! {
                result = &mut session => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "Connection ended with error");
                    }
                }
                _ = token.cancelled() => {
                    let _ = session
                        .handle()
                        .disconnect(
                            russh::Disconnect::ByApplication,
                            "server shutting down".to_string(),
                            String::new(),
                        )
                        .await;
                }
            }
            let installed = slot.lock().unwrap().take();
            if let Some(conn) = installed {
                server.teardown(conn).await;
            }
        });
    }

    /// Validate a presented identity and key against the directory.
    pub(crate) fn authorize_device(
        &self,
        user: &str,
        key: &PublicKey,
    ) -> Result<DeviceRecord, AuthRejection> {
        let Some(record) = self.directory.device(user) else {
            return Err(AuthRejection::UnknownDevice);
        };
        if record.disabled {
            return Err(AuthRejection::Disabled);
        }
        let offered = key.fingerprint(HashAlg::Sha256).to_string();
        if offered != record.key_fingerprint {
            return Err(AuthRejection::KeyMismatch);
        }
        Ok(record)
    }

    /// Install the live connection for an authenticated device, pinning
    /// its shell port and superseding any prior connection.
    pub(crate) async fn register_device_connection(
        &self,
        record: &DeviceRecord,
        peer: SocketAddr,
        handle: russh::server::Handle,
    ) -> TunnelResult<Arc<LiveConnection>> {
        let device_id = record.device_id.as_str();
        let shell_port = match record.assigned_shell_port {
            Some(port) => {
                // Already claimed when inherited from a superseded
                // connection; a stale claim by another holder surfaces as
                // a bind failure on the forward request.
                self.broker.claim(port);
                Some(port)
            }
            None => match self.broker.allocate() {
                Ok(port) => {
                    if let Err(e) = self.directory.assign_shell_port(device_id, port) {
                        self.broker.release(port);
                        return Err(e);
                    }
                    Some(port)
                }
                Err(e) => {
                    warn!(device_id, error = %e, "No shell port available for device");
                    None
                }
            },
        };

        let conn = Arc::new(LiveConnection::new(device_id, peer, handle, shell_port));

        // Close-before-insert: readers see the old connection, then
        // neither, then the new one. Never both.
        let prior = {
            self.connections
                .lock()
                .unwrap()
                .remove(device_id)
        };
        if let Some(prior) = prior {
            info!(device_id, old_peer = %prior.peer, new_peer = %peer, "Superseding existing connection");
            let released = prior.shutdown_forwards(true).await;
            for port in released {
                self.broker.release(port);
            }
            prior.close("superseded by a new connection").await;
        }
        let displaced = {
            self.connections
                .lock()
                .unwrap()
                .insert(device_id.to_string(), Arc::clone(&conn))
        };
        if let Some(displaced) = displaced {
            // A concurrent handshake for the same device landed during
            // our close; the newest authentication wins.
            displaced.close("superseded by a new connection").await;
        }

        self.directory.set_connection_state(device_id, true);
        info!(device_id, %peer, shell_port = ?shell_port, "Device connected");
        Ok(conn)
    }

    /// Remove and clean up a connection when its session ends.
    async fn teardown(&self, conn: Arc<LiveConnection>) {
        let superseded = {
            let mut map = self.connections.lock().unwrap();
            match map.get(conn.device_id.as_str()) {
                Some(current) if Arc::ptr_eq(current, &conn) => {
                    map.remove(conn.device_id.as_str());
                    false
                }
                _ => true,
            }
        };
        let released = conn.shutdown_forwards(superseded).await;
        for port in released {
            self.broker.release(port);
        }
        if !superseded {
            if let Some(port) = conn.shell_port {
                self.broker.release(port);
            }
            self.directory.set_connection_state(&conn.device_id, false);
            info!(device_id = %conn.device_id, "Device disconnected");
        }
    }

    /// Look up the live connection for a device.
    pub fn connection(&self, device_id: &str) -> Option<Arc<LiveConnection>> {
        self.connections.lock().unwrap().get(device_id).cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Send a command to a device and await its reply.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: Command,
        deadline: Duration,
    ) -> TunnelResult<ResponseEnvelope> {
        let conn = self
            .connection(device_id)
            .ok_or_else(|| TunnelError::NotConnected(device_id.to_string()))?;
        conn.send_command(command, deadline).await
    }

    /// Open a byte-stream to a container port on a device, for the proxy.
    pub async fn open_device_stream(
        &self,
        device_id: &str,
        container_port: u32,
    ) -> TunnelResult<ChannelStream<Msg>> {
        let conn = self
            .connection(device_id)
            .ok_or_else(|| TunnelError::NotConnected(device_id.to_string()))?;
        conn.open_stream(container_port, "proxy", 0).await
    }

    /// Bind a loopback listener for a device forward and return the port.
    ///
    /// Target 0 is the shell forward and lands on the device's pinned
    /// port; anything else gets the lowest free port from the broker.
    pub(crate) async fn start_forward(
        &self,
        conn: &Arc<LiveConnection>,
        target: u32,
    ) -> TunnelResult<u16> {
        let shell = target == SHELL_FORWARD_TARGET;
        let server_port = if shell {
            conn.shell_port.ok_or_else(|| {
                TunnelError::Resource("no-port-available: shell port unassigned".into())
            })?
        } else {
            self.broker.allocate()?
        };

        if conn.has_forward(server_port) {
            if !shell {
                self.broker.release(server_port);
            }
            return Err(TunnelError::Resource(format!(
                "port {server_port} already forwarded for {}",
                conn.device_id
            )));
        }

        let listener = match TcpListener::bind(("127.0.0.1", server_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                if !shell {
                    self.broker.release(server_port);
                }
                return Err(TunnelError::Transport(format!(
                    "cannot bind 127.0.0.1:{server_port}: {e}"
                )));
            }
        };

        info!(
            device_id = %conn.device_id,
            server_port,
            target,
            shell,
            "Reverse forward established"
        );
        let task = self.tracker.spawn(run_forward_listener(
            listener,
            Arc::clone(conn),
            target,
            Duration::from_secs(self.config.idle_timeout),
            self.tracker.clone(),
        ));
        conn.add_forward(server_port, ForwardEntry {
            target,
            shell,
            task,
        });
        Ok(server_port)
    }

    /// Honor a `cancel-tcpip-forward`: stop the listener and release the
    /// port immediately.
    pub(crate) async fn cancel_forward(&self, conn: &Arc<LiveConnection>, target: u32) -> bool {
        match conn.remove_forward_by_target(target) {
            Some((port, entry)) => {
                entry.task.abort();
                let _ = entry.task.await;
                self.broker.release(port);
                info!(device_id = %conn.device_id, server_port = port, target, "Reverse forward cancelled");
                true
            }
            None => false,
        }
    }

    /// Apply a heartbeat received on a device's control channel.
    pub(crate) fn handle_heartbeat(&self, conn: &LiveConnection, heartbeat: Heartbeat) {
        if heartbeat.device_id != conn.device_id {
            warn!(
                device_id = %conn.device_id,
                claimed = %heartbeat.device_id,
                "Heartbeat device ID mismatch, ignoring"
            );
            return;
        }
        debug!(
            device_id = %heartbeat.device_id,
            status = %heartbeat.status,
            "Heartbeat received"
        );
        self.directory.record_heartbeat(&heartbeat);
    }

    /// Default deadline for [`TunnelServer::send_command`] callers.
    pub fn command_deadline(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout)
    }

    /// Stop accepting, close every live connection and wait for workers.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down tunnel server");
        self.token.cancel();

        let conns: Vec<Arc<LiveConnection>> = {
            self.connections.lock().unwrap().values().cloned().collect()
        };
        for conn in conns {
            conn.close("server shutting down").await;
            self.teardown(conn).await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Tunnel server shutdown complete");
    }

    /// Cancellation token observed by auxiliary tasks (the proxy).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

async fn run_forward_listener(
    listener: TcpListener,
    conn: Arc<LiveConnection>,
    target: u32,
    idle: Duration,
    tracker: TaskTracker,
) {
    loop {
        match listener.accept().await {
            Ok((mut local, peer)) => {
                let conn = Arc::clone(&conn);
                tracker.spawn(async move {
                    match conn
                        .open_stream(target, &peer.ip().to_string(), u32::from(peer.port()))
                        .await
                    {
                        Ok(mut stream) => {
                            if let Err(e) = splice(&mut local, &mut stream, idle).await {
                                debug!(
                                    device_id = %conn.device_id,
                                    target,
                                    error = %e,
                                    "Forwarded connection ended"
                                );
                            }
                        }
                        Err(e) => {
                            debug!(device_id = %conn.device_id, target, error = %e, "Channel open failed");
                        }
                    }
                });
            }
            Err(e) => {
                debug!(error = %e, "Accept failed on forwarded port");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Last-activity clock shared by the two directions of a splice.
///
/// The idle cap is meant to reclaim sockets held by dead peers that never
/// send FIN, so it only fires when *neither* direction has moved bytes
/// within the window; one-directional transfers keep the pair alive.
struct Activity {
    epoch: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// Copy bytes both ways until each side reaches EOF, propagating
/// half-closes. The pair is torn down once it has been idle in both
/// directions for `idle`.
pub(crate) async fn splice<A, B>(a: &mut A, b: &mut B, idle: Duration) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Arc::new(Activity::new());
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    tokio::try_join!(
        copy_half(a_read, b_write, idle, Arc::clone(&activity)),
        copy_half(b_read, a_write, idle, activity)
    )
}

async fn copy_half<R, W>(
    mut read: R,
    mut write: W,
    idle: Duration,
    activity: Arc<Activity>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let remaining = idle.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "channel idle timeout",
            ));
        }
        let n = match tokio::time::timeout(remaining, read.read(&mut buf)).await {
            Ok(result) => result?,
            // This direction stalled; loop to re-check the shared clock,
            // which the other direction may have advanced.
            Err(_) => continue,
        };
        activity.touch();
        if n == 0 {
            let _ = write.shutdown().await;
            return Ok(total);
        }
        write.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use clap::Parser;
    use edgetainer_core::ResponseKind;
    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    fn test_server(directory: Arc<MemoryDirectory>) -> Arc<TunnelServer> {
        TunnelServer::new(ServerConfig::parse_from(["edgetainer-server"]), directory)
    }

    #[test]
    fn test_authorize_device_against_directory() {
        let directory = Arc::new(MemoryDirectory::new());
        let key_a = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let key_other = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        directory
            .insert_device("dev-A", &key_a.public_key().to_openssh().unwrap())
            .unwrap();
        let server = test_server(Arc::clone(&directory));

        // Unknown identity, even with a key the directory knows elsewhere.
        assert_eq!(
            server
                .authorize_device("dev-B", key_a.public_key())
                .unwrap_err()
                .category(),
            "unknown-device"
        );
        // Known identity, wrong key.
        assert_eq!(
            server
                .authorize_device("dev-A", key_other.public_key())
                .unwrap_err()
                .category(),
            "bad-key"
        );
        // Matching identity and key.
        let record = server.authorize_device("dev-A", key_a.public_key()).unwrap();
        assert_eq!(record.device_id, "dev-A");

        directory.set_disabled("dev-A", true);
        assert_eq!(
            server
                .authorize_device("dev-A", key_a.public_key())
                .unwrap_err()
                .category(),
            "device-disabled"
        );
    }

    #[tokio::test]
    async fn test_pending_commands_resolve() {
        let pending = PendingCommands::new();
        let id = CommandId::new();
        let rx = pending.register(id);

        assert!(pending.resolve(ResponseEnvelope::success(id, ResponseKind::Success, "ok")));
        let response = rx.await.unwrap();
        assert_eq!(response.command_id, id);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_discarded_slot_ignores_late_reply() {
        let pending = PendingCommands::new();
        let id = CommandId::new();
        let rx = pending.register(id);

        // Deadline expiry unlinks the slot before the reply lands.
        pending.discard(id);
        drop(rx);
        assert!(!pending.resolve(ResponseEnvelope::success(id, ResponseKind::Success, "late")));

        // A later command on the same connection is unaffected.
        let next = CommandId::new();
        let rx = pending.register(next);
        assert!(pending.resolve(ResponseEnvelope::success(next, ResponseKind::Success, "ok")));
        assert_eq!(rx.await.unwrap().command_id, next);
    }

    #[tokio::test]
    async fn test_independent_responses_per_command() {
        let pending = PendingCommands::new();
        let first = CommandId::new();
        let second = CommandId::new();
        let rx_first = pending.register(first);
        let rx_second = pending.register(second);

        assert!(pending.resolve(ResponseEnvelope::success(second, ResponseKind::Status, "b")));
        assert!(pending.resolve(ResponseEnvelope::success(first, ResponseKind::Status, "a")));
        assert_eq!(rx_first.await.unwrap().command_id, first);
        assert_eq!(rx_second.await.unwrap().command_id, second);
    }

    #[tokio::test]
    async fn test_splice_copies_both_ways_and_half_closes() {
        let (mut client, mut near) = tokio::io::duplex(64);
        let (mut device, mut far) = tokio::io::duplex(64);

        let pipe = tokio::spawn(async move {
            splice(&mut near, &mut far, Duration::from_secs(5)).await
        });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client EOF half-closes toward the device.
        drop(client);
        let mut end = Vec::new();
        device.read_to_end(&mut end).await.unwrap();
        assert!(end.is_empty());
        drop(device);

        let (sent, received) = pipe.await.unwrap().unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_splice_enforces_idle_cap() {
        let (_client, mut near) = tokio::io::duplex(64);
        let (_device, mut far) = tokio::io::duplex(64);

        let result = splice(&mut near, &mut far, Duration::from_millis(50)).await;
        match result {
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            Ok(_) => panic!("idle splice should time out"),
        }
    }

    #[tokio::test]
    async fn test_splice_survives_one_directional_traffic() {
        let (mut client, mut near) = tokio::io::duplex(64);
        let (mut device, mut far) = tokio::io::duplex(64);

        let pipe = tokio::spawn(async move {
            splice(&mut near, &mut far, Duration::from_millis(100)).await
        });

        // Push bytes one way only, for several multiples of the idle cap;
        // the silent return direction must not tear the pair down.
        let mut byte = [0u8; 1];
        for _ in 0..8 {
            client.write_all(b"x").await.unwrap();
            device.read_exact(&mut byte).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert!(!pipe.is_finished());

        drop(client);
        drop(device);
        let (sent, received) = pipe.await.unwrap().unwrap();
        assert_eq!(sent, 8);
        assert_eq!(received, 0);
    }
}
