//! Log reader: reconstructs one deterministic stream from the chunks of
//! one or more descriptors.
//!
//! Per descriptor, chunk keys are listed in ascending order, folded into
//! contiguous windows, and entries deduplicated so each sequence number
//! appears at most once (first occurrence wins). Across descriptors,
//! entries merge in non-decreasing server-timestamp order with ties broken
//! by (descriptor id, sequence number) — a total order, so identical
//! inputs always render identical output.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use conveyor_core::log::{LogDescriptor, LogEntry};
use conveyor_core::store::BlobStore;
use conveyor_core::{Error, Result};

use crate::chunk::{ChunkKey, chunk_prefix, fold_windows};

/// Page size for chunk-key listings.
const LIST_PAGE: usize = 1_000;

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Skip entries below this sequence number. Only valid when reading a
    /// single descriptor.
    pub start_seq: Option<u64>,
    /// Render newline-delimited text instead of the structured array.
    pub plaintext: bool,
    /// Include the descriptor's descendants (build -> jobs -> steps).
    pub expand: bool,
}

pub struct LogReader {
    blobs: Arc<dyn BlobStore>,
    descriptors: Vec<LogDescriptor>,
    start_seq: Option<u64>,
}

impl LogReader {
    /// `descriptors` must be non-empty; they are sorted by id here so the
    /// merge tie-break is fixed at construction.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        mut descriptors: Vec<LogDescriptor>,
        start_seq: Option<u64>,
    ) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(Error::ValidationFailed("no log descriptors".to_string()));
        }
        if start_seq.is_some() && descriptors.len() > 1 {
            return Err(Error::ValidationFailed(
                "start sequence requires a single descriptor".to_string(),
            ));
        }
        descriptors.sort_by_key(|d| d.id);
        Ok(Self {
            blobs,
            descriptors,
            start_seq,
        })
    }

    /// The merged entry stream, without framing.
    pub async fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut merged: Vec<(String, LogEntry)> = Vec::new();
        for descriptor in &self.descriptors {
            let id = descriptor.id.to_string();
            for entry in self.descriptor_entries(descriptor).await? {
                merged.push((id.clone(), entry));
            }
        }
        merged.sort_by(|(a_id, a), (b_id, b)| {
            merge_key(a, a_id)
                .cmp(&merge_key(b, b_id))
        });
        Ok(merged.into_iter().map(|(_, e)| e).collect())
    }

    /// Whether every source descriptor is sealed.
    pub fn all_sealed(&self) -> bool {
        self.descriptors.iter().all(|d| d.sealed)
    }

    /// Structured output: a JSON array, one delimiter between entries, and
    /// a synthetic `end` entry before the close when all sources are
    /// sealed. Byte-identical across reads of the same sealed set.
    pub async fn render(&self) -> Result<String> {
        let entries = self.entries().await?;
        let mut out = String::from("[");
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(
                &serde_json::to_string(entry)
                    .map_err(|e| Error::Transport(format!("encoding log entry: {e}")))?,
            );
        }
        if self.all_sealed() {
            let end = LogEntry::End {
                seq: entries.last().map_or(0, |e| e.seq() + 1),
                // No timestamp: the synthetic entry must not vary between
                // reads.
                server_ts: None,
            };
            if !entries.is_empty() {
                out.push(',');
            }
            out.push_str(
                &serde_json::to_string(&end)
                    .map_err(|e| Error::Transport(format!("encoding log entry: {e}")))?,
            );
        }
        out.push(']');
        Ok(out)
    }

    /// Plaintext output: one line per entry that carries text.
    pub async fn render_plaintext(&self) -> Result<String> {
        let entries = self.entries().await?;
        let mut out = String::new();
        for entry in &entries {
            if let Some(text) = entry.text() {
                out.push_str(text);
                out.push('\n');
            }
        }
        Ok(out)
    }

    /// Deduplicated entries of one descriptor, window by window.
    async fn descriptor_entries(&self, descriptor: &LogDescriptor) -> Result<Vec<LogEntry>> {
        let prefix = chunk_prefix(descriptor.subject_id, descriptor.id);
        let mut keys: Vec<ChunkKey> = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .blobs
                .list_prefix(&prefix, after.as_deref(), LIST_PAGE)
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };
            for key in page {
                match ChunkKey::parse(&key) {
                    Some(parsed) => keys.push(parsed),
                    // The blob may still be readable via an overlapping
                    // chunk; skip rather than fail the read.
                    None => warn!(key, "skipping unparseable chunk key"),
                }
            }
            after = Some(last);
        }

        let mut seen: HashSet<u64> = HashSet::new();
        let mut entries: Vec<LogEntry> = Vec::new();
        for window in fold_windows(keys) {
            for chunk in &window.chunks {
                let key = chunk.to_key();
                let Some(body) = self.blobs.get(&key).await? else {
                    warn!(key, "chunk listed but missing on read");
                    continue;
                };
                let parsed: Vec<LogEntry> = match serde_json::from_slice(&body) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(key, %err, "skipping undecodable chunk");
                        continue;
                    }
                };
                for entry in parsed {
                    if let Some(start) = self.start_seq {
                        if entry.seq() < start {
                            continue;
                        }
                    }
                    if seen.insert(entry.seq()) {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }
}

fn merge_key<'a>(entry: &LogEntry, descriptor_id: &'a str) -> (DateTime<Utc>, &'a str, u64) {
    (
        entry.server_ts().unwrap_or(DateTime::<Utc>::MIN_UTC),
        descriptor_id,
        entry.seq(),
    )
}
