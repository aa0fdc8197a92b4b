#![forbid(unsafe_code)]

//! Client-side connection layer for Agent Client Protocol agents.

pub mod acp;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::ClientConfig;
pub use errors::{AppError, Result};
