//! Log descriptors and the wire shape of log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Metadata record for one log stream.
///
/// Descriptors form a tree rooted at the build's descriptor (build -> job
/// -> step). The descriptor row is authoritative for sealing and size; the
/// blob store is authoritative for content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDescriptor {
    pub id: ResourceId,
    pub parent_id: Option<ResourceId>,
    /// The resource this log belongs to (build, job, or step id).
    pub subject_id: ResourceId,
    /// Once sealed, no further writes succeed.
    pub sealed: bool,
    /// Accumulated size of all persisted chunks, in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub etag: i64,
}

impl LogDescriptor {
    pub fn new(subject_id: ResourceId, parent_id: Option<ResourceId>) -> Self {
        Self {
            id: ResourceId::new(),
            parent_id,
            subject_id,
            sealed: false,
            size: 0,
            created_at: Utc::now(),
            etag: 1,
        }
    }
}

/// One log entry as carried on the wire and inside chunks.
///
/// The `kind` discriminator selects the payload shape. Sequence numbers are
/// client-assigned and monotone within a writer stream; `server_ts` is
/// stamped on write receipt and drives the merge order on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    /// A plain text line.
    Line {
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ts: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_ts: Option<DateTime<Utc>>,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        line_no: Option<u64>,
        /// Name of the enclosing block, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_block: Option<String>,
    },
    /// Opens a named block that later lines may reference.
    BlockOpen {
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ts: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_ts: Option<DateTime<Utc>>,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_block: Option<String>,
    },
    /// End of stream. Appended synthetically by the reader when every
    /// source descriptor is sealed.
    End {
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_ts: Option<DateTime<Utc>>,
    },
}

impl LogEntry {
    pub fn seq(&self) -> u64 {
        match self {
            LogEntry::Line { seq, .. } | LogEntry::BlockOpen { seq, .. } | LogEntry::End { seq, .. } => {
                *seq
            }
        }
    }

    pub fn server_ts(&self) -> Option<DateTime<Utc>> {
        match self {
            LogEntry::Line { server_ts, .. }
            | LogEntry::BlockOpen { server_ts, .. }
            | LogEntry::End { server_ts, .. } => *server_ts,
        }
    }

    pub fn stamp_server_ts(&mut self, at: DateTime<Utc>) {
        match self {
            LogEntry::Line { server_ts, .. }
            | LogEntry::BlockOpen { server_ts, .. }
            | LogEntry::End { server_ts, .. } => *server_ts = Some(at),
        }
    }

    /// Plaintext payload, for entries that carry one.
    pub fn text(&self) -> Option<&str> {
        match self {
            LogEntry::Line { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Convenience constructor for a bare line.
    pub fn line(seq: u64, text: impl Into<String>) -> Self {
        LogEntry::Line {
            seq,
            client_ts: None,
            server_ts: None,
            text: text.into(),
            line_no: None,
            parent_block: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_discriminator_round_trips() {
        let entry = LogEntry::line(7, "compiling");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"line\""));
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn end_entry_omits_absent_timestamp() {
        let end = LogEntry::End {
            seq: 3,
            server_ts: None,
        };
        let json = serde_json::to_string(&end).unwrap();
        assert_eq!(json, r#"{"kind":"end","seq":3}"#);
    }

    #[test]
    fn only_lines_carry_text() {
        let block = LogEntry::BlockOpen {
            seq: 1,
            client_ts: None,
            server_ts: None,
            name: "tests".into(),
            parent_block: None,
        };
        assert!(block.text().is_none());
        assert_eq!(LogEntry::line(2, "ok").text(), Some("ok"));
    }
}
