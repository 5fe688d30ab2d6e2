//! Chunk blob keys and window assembly.
//!
//! A chunk key is `logs/{subject-id}/{log-id}/{end}-{start}-{session}.json`
//! with both sequence numbers zero-padded to sixteen digits. End comes
//! first so plain lexicographic key order ascends by window end, which is
//! what the reader's prefix listing relies on.

use conveyor_core::{ResourceId, SessionId};

/// Zero-padding width for sequence numbers inside chunk keys.
const SEQ_WIDTH: usize = 16;

/// Blob-key prefix holding every chunk of one log.
pub fn chunk_prefix(subject_id: ResourceId, log_id: ResourceId) -> String {
    format!("logs/{subject_id}/{log_id}/")
}

/// Parsed form of one chunk key. The sequence range is half-open:
/// `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    pub subject_id: ResourceId,
    pub log_id: ResourceId,
    pub start: u64,
    pub end: u64,
    pub session: SessionId,
}

impl ChunkKey {
    pub fn new(
        subject_id: ResourceId,
        log_id: ResourceId,
        start: u64,
        end: u64,
        session: SessionId,
    ) -> Self {
        Self {
            subject_id,
            log_id,
            start,
            end,
            session,
        }
    }

    /// Render the full blob key.
    pub fn to_key(&self) -> String {
        format!(
            "{}{:0width$}-{:0width$}-{}.json",
            chunk_prefix(self.subject_id, self.log_id),
            self.end,
            self.start,
            self.session.as_simple(),
            width = SEQ_WIDTH,
        )
    }

    /// Parse a blob key. `None` for keys that do not follow the chunk
    /// naming scheme.
    pub fn parse(key: &str) -> Option<ChunkKey> {
        let rest = key.strip_prefix("logs/")?;
        let mut parts = rest.splitn(3, '/');
        let subject_id: ResourceId = parts.next()?.parse().ok()?;
        let log_id: ResourceId = parts.next()?.parse().ok()?;
        let file = parts.next()?.strip_suffix(".json")?;

        let mut fields = file.splitn(3, '-');
        let end: u64 = fields.next()?.parse().ok()?;
        let start: u64 = fields.next()?.parse().ok()?;
        let session: SessionId = fields.next()?.parse().ok()?;
        if start > end {
            return None;
        }
        Some(ChunkKey {
            subject_id,
            log_id,
            start,
            end,
            session,
        })
    }
}

/// A maximal contiguous sequence range covered by one or more chunks.
#[derive(Debug)]
pub struct Window {
    pub start: u64,
    pub end: u64,
    /// Contributing chunks, ordered by start sequence.
    pub chunks: Vec<ChunkKey>,
}

fn touches(window: &Window, start: u64, end: u64) -> bool {
    // Half-open ranges overlap or abut.
    start <= window.end && window.start <= end
}

fn subsumes(start: u64, end: u64, window: &Window) -> bool {
    start <= window.start && end >= window.end
}

/// Fold chunks into windows. Input order does not matter for correctness,
/// but listings arrive ascending by end sequence. Output windows ascend by
/// start sequence.
pub fn fold_windows(chunks: Vec<ChunkKey>) -> Vec<Window> {
    let mut windows: Vec<Window> = Vec::new();
    for chunk in chunks {
        let (start, end) = (chunk.start, chunk.end);
        let mut merged = Window {
            start,
            end,
            chunks: vec![chunk],
        };
        let (touching, mut rest): (Vec<Window>, Vec<Window>) = windows
            .into_iter()
            .partition(|w| touches(w, start, end));
        for window in touching {
            merged.start = merged.start.min(window.start);
            merged.end = merged.end.max(window.end);
            // A chunk that covers the whole window stands in for its
            // chunks; otherwise the window's chunks carry over.
            if !subsumes(start, end, &window) {
                merged.chunks.extend(window.chunks);
            }
        }
        merged.chunks.sort_by_key(|c| (c.start, c.end));
        rest.push(merged);
        windows = rest;
    }
    windows.sort_by_key(|w| w.start);
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(start: u64, end: u64) -> ChunkKey {
        ChunkKey::new(
            ResourceId::new(),
            ResourceId::new(),
            start,
            end,
            SessionId::new(),
        )
    }

    #[test]
    fn key_round_trips() {
        let original = ChunkKey::new(ResourceId::new(), ResourceId::new(), 5, 120, SessionId::new());
        let parsed = ChunkKey::parse(&original.to_key()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn key_order_ascends_by_end() {
        let subject = ResourceId::new();
        let log = ResourceId::new();
        let session = SessionId::new();
        let a = ChunkKey::new(subject, log, 0, 9, session).to_key();
        let b = ChunkKey::new(subject, log, 5, 100, session).to_key();
        let c = ChunkKey::new(subject, log, 90, 1000, session).to_key();
        let mut keys = vec![c.clone(), a.clone(), b.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(ChunkKey::parse("logs/not-a-uuid/x/1-2-3.json").is_none());
        assert!(ChunkKey::parse("artifacts/whatever").is_none());
        // start > end is nonsense.
        let subject = ResourceId::new();
        let log = ResourceId::new();
        let bad = format!(
            "logs/{subject}/{log}/{:016}-{:016}-{}.json",
            5,
            10,
            SessionId::new().as_simple()
        );
        assert!(ChunkKey::parse(&bad).is_none());
    }

    #[test]
    fn disjoint_chunks_make_separate_windows() {
        let windows = fold_windows(vec![key(0, 10), key(20, 30)]);
        assert_eq!(windows.len(), 2);
        assert_eq!((windows[0].start, windows[0].end), (0, 10));
        assert_eq!((windows[1].start, windows[1].end), (20, 30));
    }

    #[test]
    fn abutting_and_overlapping_chunks_merge() {
        let windows = fold_windows(vec![key(0, 10), key(10, 20), key(15, 25)]);
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start, windows[0].end), (0, 25));
        assert_eq!(windows[0].chunks.len(), 3);
    }

    #[test]
    fn subsuming_chunk_replaces_window() {
        let windows = fold_windows(vec![key(5, 10), key(0, 20)]);
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start, windows[0].end), (0, 20));
        // The covered chunk was dropped in favor of the subsuming one.
        assert_eq!(windows[0].chunks.len(), 1);
        assert_eq!((windows[0].chunks[0].start, windows[0].chunks[0].end), (0, 20));
    }

    #[test]
    fn bridging_chunk_joins_two_windows() {
        let windows = fold_windows(vec![key(0, 5), key(10, 15), key(5, 10)]);
        assert_eq!(windows.len(), 1);
        assert_eq!((windows[0].start, windows[0].end), (0, 15));
        assert_eq!(windows[0].chunks.len(), 3);
    }
}
