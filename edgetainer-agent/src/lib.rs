//! Edgetainer device agent library.
//!
//! Runs on an edge device behind NAT, holds the reverse tunnel to the
//! management server open and executes the commands arriving over it.
//! The binary in `main.rs` wires the pieces together.

pub mod commands;
pub mod config;
pub mod monitor;
pub mod tunnel;
