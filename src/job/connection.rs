use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{CiError, Result};

/// Marker that precedes the exit code in the final frame of every response.
pub const SENTINEL_PREFIX: &str = "%*&";

/// Exit code reported for a job that finished successfully.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code reported for any failed job.
pub const EXIT_FAILURE: i32 = 1;

/// Encode the terminal frame `%*&<code>\n`.
pub fn sentinel(exit_code: i32) -> Vec<u8> {
    format!("{SENTINEL_PREFIX}{exit_code}\n").into_bytes()
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a client connection.
///
/// Owned by exactly one job at a time. Once [`Connection::finish`] has written
/// the sentinel, or a write has failed, every further send is refused.
pub struct Connection {
    peer: String,
    writer: Option<Writer>,
    disconnected: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("open", &self.writer.is_some())
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl Connection {
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer: peer.into(),
            writer: Some(Box::new(writer)),
            disconnected: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// No more bytes will be written, either because the sentinel went out
    /// or the peer went away.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// A write failed at some point; the client is gone.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Write raw bytes. Empty payloads are skipped.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or(CiError::ClientDisconnected)?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(peer = %self.peer, error = %e, "Write to client failed");
            self.disconnected = true;
            self.writer = None;
            return Err(CiError::ClientDisconnected);
        }
        Ok(())
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.send(&bytes).await
    }

    /// Write the sentinel frame and close. Only the first call writes anything.
    pub async fn finish(&mut self, exit_code: i32) -> Result<()> {
        let result = self.send(&sentinel(exit_code)).await;
        self.close().await;
        result
    }

    /// Close without a sentinel (used for rejected requests).
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(peer = %self.peer, error = %e, "Shutdown of client socket failed");
            }
        }
    }
}
