//! Domain model module declarations.

pub mod connection;
pub mod session;
