//! Edgetainer management server library.
//!
//! Accepts persistent SSH tunnels from edge devices, assigns each device
//! a stable loopback port for its shell, dispatches operator commands
//! over the tunnels and reverse-proxies HTTPS traffic into device
//! containers. The binary in `main.rs` wires these pieces together; the
//! REST/API layer consumes [`tunnel::TunnelServer`] directly.

pub mod broker;
pub mod config;
pub mod directory;
mod handler;
pub mod hostkey;
pub mod proxy;
pub mod shutdown;
pub mod tls;
pub mod tunnel;
