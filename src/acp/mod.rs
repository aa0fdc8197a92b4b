//! Agent Client Protocol (ACP) stream handling.
//!
//! Wire-level pieces of the agent connection:
//! - `message`: JSON-RPC message shapes and classification.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based NDJSON framing.
//! - `pending`: registry of our outstanding calls.
//! - `writer`: serialized write path shared by every sender.
//! - `transport`: one live connection (read loop, exit monitor, calls).
//! - `router`: fan-out of agent-initiated notifications and calls.
//! - `handshake`: `initialize` readiness probing.
//! - `spawner`: process launch with environment isolation and stdio capture.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod pending;
pub mod router;
pub mod spawner;
pub mod transport;
pub mod writer;
