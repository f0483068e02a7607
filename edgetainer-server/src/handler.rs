//! Per-connection SSH handler.
//!
//! Authenticates devices against the directory, accepts the agent's
//! control channel, and routes forward requests into the tunnel server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use edgetainer_core::{ControlFrame, FrameCodec};
use russh::keys::PublicKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tracing::{debug, info, warn};

use crate::directory::DeviceRecord;
use crate::tunnel::{LiveConnection, TunnelServer};

const SHELL_BANNER: &str =
    "edgetainer: no interactive shell here; connect through your device's forwarded port\r\n";

/// Slot through which the connection task learns which live connection
/// (if any) this handler installed, so it can tear it down at exit.
pub(crate) type InstalledSlot = Arc<Mutex<Option<Arc<LiveConnection>>>>;

pub(crate) struct ServerHandler {
    server: Arc<TunnelServer>,
    peer: SocketAddr,
    record: Option<DeviceRecord>,
    connection: Option<Arc<LiveConnection>>,
    installed: InstalledSlot,
    codec: FrameCodec,
}

impl ServerHandler {
    pub(crate) fn new(server: Arc<TunnelServer>, peer: SocketAddr, installed: InstalledSlot) -> Self {
        Self {
            server,
            peer,
            record: None,
            connection: None,
            installed,
            codec: FrameCodec::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

impl russh::server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        info!(peer = %self.peer, user, "Rejecting password login attempt");
        Ok(Self::reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.server.authorize_device(user, key) {
            Ok(_) => Ok(Auth::Accept),
            Err(rejection) => {
                debug!(peer = %self.peer, user, category = rejection.category(), "Offered key not acceptable");
                Ok(Self::reject())
            }
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        match self.server.authorize_device(user, key) {
            Ok(record) => {
                info!(peer = %self.peer, device_id = user, "Device authenticated");
                self.record = Some(record);
                Ok(Auth::Accept)
            }
            Err(rejection) => {
                info!(
                    peer = %self.peer,
                    user,
                    category = rejection.category(),
                    "Authentication failed"
                );
                Ok(Self::reject())
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let Some(record) = self.record.clone() else {
            return Err(russh::Error::Inconsistent);
        };
        match self
            .server
            .register_device_connection(&record, self.peer, session.handle())
            .await
        {
            Ok(conn) => {
                *self.installed.lock().unwrap() = Some(Arc::clone(&conn));
                self.connection = Some(conn);
                Ok(())
            }
            Err(e) => {
                warn!(device_id = %record.device_id, error = %e, "Failed to register connection");
                Err(russh::Error::Disconnect)
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(conn) = &self.connection else {
            return Ok(false);
        };
        if conn.set_control(channel.id()) {
            debug!(device_id = %conn.device_id, "Control channel opened");
        }
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(conn) = &self.connection else {
            return Ok(());
        };
        if conn.control_channel() != Some(channel) {
            return Ok(());
        }
        self.codec.extend(data);
        while let Some(frame) = self.codec.next_frame() {
            match frame {
                Ok(ControlFrame::Heartbeat(heartbeat)) => {
                    self.server.handle_heartbeat(conn, heartbeat);
                }
                Ok(ControlFrame::Response(response)) => {
                    if !conn.pending().resolve(response) {
                        debug!(device_id = %conn.device_id, "Discarding late or unmatched response");
                    }
                }
                Ok(ControlFrame::Command(envelope)) => {
                    warn!(
                        device_id = %conn.device_id,
                        command = envelope.command.name(),
                        "Ignoring command frame sent by device"
                    );
                }
                Err(e) => {
                    warn!(device_id = %conn.device_id, error = %e, "Bad control frame");
                }
            }
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        _address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(conn) = self.connection.clone() else {
            return Ok(false);
        };
        match self.server.start_forward(&conn, *port).await {
            Ok(bound) => {
                *port = u32::from(bound);
                Ok(true)
            }
            Err(e) => {
                warn!(device_id = %conn.device_id, target = *port, error = %e, "Forward request refused");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(conn) = self.connection.clone() else {
            return Ok(false);
        };
        Ok(self.server.cancel_forward(&conn, port).await)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Accepted so stock SSH tooling can attach, but only a banner
        // comes back; the command envelope path is the one surface.
        let _ = session.channel_success(channel);
        let _ = session.data(channel, CryptoVec::from(SHELL_BANNER.as_bytes().to_vec()));
        let _ = session.close(channel);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        let _ = session.close(channel);
        Ok(())
    }
}
