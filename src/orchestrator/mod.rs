//! Connection orchestration.
//!
//! Covers endpoint candidate planning, the connection state machine with
//! reconnection, and the active-session controller.

pub mod connection_manager;
pub mod endpoint;
pub mod session_controller;
