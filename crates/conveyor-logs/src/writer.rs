//! Log writer: buffers client entries and persists them as chunk blobs.
//!
//! Multiple writers may serve the same descriptor concurrently; each
//! carries a fresh random session id, so their chunk keys never collide.
//! Sequence numbers are trusted as supplied. A flush failure is sticky:
//! every later write or flush returns it until the writer is discarded.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use conveyor_core::log::{LogDescriptor, LogEntry};
use conveyor_core::store::BlobStore;
use conveyor_core::{Error, Result, SessionId};

use crate::chunk::ChunkKey;

#[derive(Debug, Clone)]
pub struct LogWriterConfig {
    /// Flush once the buffered chunk body reaches this size.
    pub chunk_size_target: usize,
    /// Flush once the oldest buffered entry is this old.
    pub chunk_ttl: Duration,
    /// Upper bound on one chunk write, independent of the caller's
    /// cancellation.
    pub flush_timeout: Duration,
}

impl Default for LogWriterConfig {
    fn default() -> Self {
        Self {
            chunk_size_target: 1024 * 1024,
            chunk_ttl: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

pub struct LogWriter {
    blobs: Arc<dyn BlobStore>,
    subject_id: conveyor_core::ResourceId,
    log_id: conveyor_core::ResourceId,
    session: SessionId,
    config: LogWriterConfig,
    /// Entries encoded at write time, so size-based flushing sees real
    /// byte counts.
    encoded: Vec<Vec<u8>>,
    buffered_bytes: usize,
    /// Half-open `[start, end)` range of buffered sequence numbers.
    range: Option<(u64, u64)>,
    buffered_since: Option<Instant>,
    /// Sticky failure from an earlier flush.
    failed: Option<String>,
    bytes_written: u64,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("subject_id", &self.subject_id)
            .field("log_id", &self.log_id)
            .field("session", &self.session)
            .field("config", &self.config)
            .field("buffered_bytes", &self.buffered_bytes)
            .field("range", &self.range)
            .field("buffered_since", &self.buffered_since)
            .field("failed", &self.failed)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl LogWriter {
    /// Fails with `log-closed` when the descriptor is already sealed.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        descriptor: &LogDescriptor,
        config: LogWriterConfig,
    ) -> Result<Self> {
        if descriptor.sealed {
            return Err(Error::LogClosed(descriptor.id.to_string()));
        }
        Ok(Self {
            blobs,
            subject_id: descriptor.subject_id,
            log_id: descriptor.id,
            session: SessionId::new(),
            config,
            encoded: Vec::new(),
            buffered_bytes: 0,
            range: None,
            buffered_since: None,
            failed: None,
            bytes_written: 0,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Total chunk bytes persisted so far, for descriptor size accounting.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn sticky(&self) -> Result<()> {
        match &self.failed {
            Some(msg) => Err(Error::Transport(msg.clone())),
            None => Ok(()),
        }
    }

    /// Accept a batch of entries, stamping each with the server's clock.
    /// Flushes when the buffer crosses the size target or the TTL.
    pub async fn write(&mut self, mut entries: Vec<LogEntry>) -> Result<()> {
        self.sticky()?;
        let now = Utc::now();
        for entry in &mut entries {
            entry.stamp_server_ts(now);
            let seq = entry.seq();
            self.range = Some(match self.range {
                None => (seq, seq + 1),
                Some((start, end)) => (start.min(seq), end.max(seq + 1)),
            });
            let body = serde_json::to_vec(entry)
                .map_err(|e| Error::Transport(format!("encoding log entry: {e}")))?;
            self.buffered_bytes += body.len() + 1;
            self.encoded.push(body);
        }
        if self.buffered_since.is_none() && !self.encoded.is_empty() {
            self.buffered_since = Some(Instant::now());
        }

        let ttl_expired = self
            .buffered_since
            .is_some_and(|since| since.elapsed() >= self.config.chunk_ttl);
        if self.buffered_bytes >= self.config.chunk_size_target || ttl_expired {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist the buffered entries as one chunk. A failure (including the
    /// write timeout) is remembered and returned from every subsequent
    /// call; entries are never dropped silently.
    pub async fn flush(&mut self) -> Result<()> {
        self.sticky()?;
        let Some((start, end)) = self.range else {
            return Ok(());
        };

        let key = ChunkKey::new(self.subject_id, self.log_id, start, end, self.session).to_key();
        let mut body = Vec::with_capacity(self.buffered_bytes + 1);
        body.push(b'[');
        for (i, entry) in self.encoded.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(entry);
        }
        body.push(b']');
        let size = body.len() as u64;

        let write = self.blobs.put(&key, Bytes::from(body));
        match tokio::time::timeout(self.config.flush_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.failed = Some(err.to_string());
                return Err(err);
            }
            Err(_) => {
                let msg = format!("chunk write timed out after {:?}", self.config.flush_timeout);
                self.failed = Some(msg.clone());
                return Err(Error::Transport(msg));
            }
        }

        debug!(key, entries = self.encoded.len(), size, "flushed log chunk");
        self.bytes_written += size;
        self.encoded.clear();
        self.buffered_bytes = 0;
        self.range = None;
        self.buffered_since = None;
        Ok(())
    }
}
