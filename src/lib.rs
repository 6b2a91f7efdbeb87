//! wristlink relay library
//!
//! Core functionality for the wristlink relay: room management, event
//! routing, the per-room snapshot cache, and the WebSocket server
//! surface. The binary in `main.rs` wires these together; integration
//! tests drive them directly.

pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod server;
