//! Core types and protocols for the edgetainer tunnel system.
//!
//! This crate provides shared functionality between the management server
//! and the device agent: the command/response/heartbeat envelopes carried
//! over the tunnel's control channel, and the error taxonomy.

pub mod error;
pub mod protocol;

pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use protocol::{
    Command, CommandEnvelope, CommandId, ContainerStatus, ControlFrame, FrameCodec, FrameError,
    Heartbeat, HeartbeatStatus, ResponseEnvelope, ResponseKind, DEFAULT_END_PORT, DEFAULT_SSH_PORT,
    DEFAULT_START_PORT, SHELL_FORWARD_TARGET,
};
