//! ACP write path.
//!
//! [`Wire`] is the single point through which every outbound message
//! reaches the agent. Each message is encoded into one complete
//! `\n`-terminated line *before* the writer lock is taken, and the whole line
//! is written and flushed while the lock is held, so concurrent senders can
//! never interleave partial lines on the wire.
//!
//! A write abandoned halfway through a line leaves the framing broken; the
//! wire marks itself stalled and refuses every later write.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tracing::{trace, warn};

use crate::acp::codec::MessageCodec;
use crate::acp::message::Message;
use crate::{AppError, Result};

/// Boxed byte sink for the agent's input channel (stdin or a socket half).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serialized outbound channel to one agent.
pub struct Wire {
    connection_id: String,
    writer: Mutex<BoxedWriter>,
    stalled: AtomicBool,
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wire")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl Wire {
    /// Wrap `writer` as the outbound half of connection `connection_id`.
    #[must_use]
    pub fn new(connection_id: impl Into<String>, writer: BoxedWriter) -> Self {
        Self {
            connection_id: connection_id.into(),
            writer: Mutex::new(writer),
            stalled: AtomicBool::new(false),
        }
    }

    /// Encode `message` and write it as one line.
    ///
    /// Writes for a single caller land in the order `send` was invoked.
    ///
    /// # Errors
    ///
    /// - [`AppError::Acp`]`("failed to serialise outbound message: …")` if
    ///   encoding fails (should not occur for `Value` payloads).
    /// - [`AppError::Io`]`("write failed: …")` if the write or flush fails,
    ///   typically because the agent has exited, or the wire has stalled.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let buf = encode(message)?;
        let mut writer = self.writer.lock().await;
        self.write_line(&mut writer, message, &buf).await
    }

    /// Like [`Self::send`], but give up at `deadline`.
    ///
    /// # Errors
    ///
    /// As [`Self::send`], plus [`AppError::RequestTimeout`] when the deadline
    /// passes while waiting for the writer or while writing. In the latter
    /// case the line may be incomplete and the wire is stalled for good.
    pub async fn send_until(&self, message: &Message, deadline: Instant) -> Result<()> {
        let buf = encode(message)?;
        let method = message.method().unwrap_or("<response>");

        let Ok(mut writer) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            return Err(AppError::RequestTimeout(format!(
                "{method} not written: writer busy until deadline"
            )));
        };

        match tokio::time::timeout_at(deadline, self.write_line(&mut writer, message, &buf)).await
        {
            Ok(written) => written,
            Err(_elapsed) => {
                self.stalled.store(true, Ordering::Release);
                warn!(
                    connection_id = self.connection_id,
                    method, "acp writer: write stalled, agent is not reading"
                );
                Err(AppError::RequestTimeout(format!(
                    "{method} not written: agent stopped reading its input"
                )))
            }
        }
    }

    /// Whether a write was abandoned mid-line.
    #[must_use]
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    async fn write_line(&self, writer: &mut BoxedWriter, message: &Message, buf: &[u8]) -> Result<()> {
        if self.is_stalled() {
            return Err(AppError::Io("write failed: wire stalled".into()));
        }

        let written = async {
            writer.write_all(buf).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            warn!(connection_id = self.connection_id, error = %e, "acp writer: write failed");
            AppError::Io(format!("write failed: {e}"))
        })?;

        trace!(
            connection_id = self.connection_id,
            method = message.method().unwrap_or("<response>"),
            bytes = buf.len(),
            "acp writer: line written"
        );
        Ok(())
    }

    /// Shut down the outbound half so the agent sees EOF on its input.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!(connection_id = self.connection_id, error = %e, "acp writer: shutdown failed");
        }
    }
}

fn encode(message: &Message) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(message, &mut buf)?;
    Ok(buf)
}
