//! Blob storage abstraction.
//!
//! The blob store is treated as an immutable, append-only keyspace: chunk
//! and artifact writers never reuse a key, so `put` has last-write-wins
//! semantics only for crash-retried writes of identical content.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Minimal capability interface the core consumes. Concrete backends
/// (object store, filesystem, in-memory) are injected.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob under `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fetch a blob. `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// List keys beginning with `prefix` in ascending lexicographic order,
    /// starting strictly after `after` when given. Returns at most `limit`
    /// keys; callers paginate by passing the last key back as `after`.
    async fn list_prefix(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Remove a blob. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}
