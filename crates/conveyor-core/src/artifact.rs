//! Artifact metadata and blob keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::job::Digest;

/// Metadata for one artifact produced by a job.
///
/// The row is authoritative for identity and expected content; the blob
/// store holds the bytes at [`Artifact::blob_key`]. `(job_id, group, path)`
/// is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ResourceId,
    pub job_id: ResourceId,
    /// Artifact group name declared in the job definition.
    pub group: String,
    /// Path relative to the job workspace.
    pub path: String,
    pub size: u64,
    pub digest: Digest,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        job_id: ResourceId,
        group: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        digest: Digest,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            job_id,
            group: group.into(),
            path: path.into(),
            size,
            digest,
            created_at: Utc::now(),
        }
    }

    /// Blob-store key for the artifact content.
    pub fn blob_key(&self) -> String {
        artifact_blob_key(&self.job_id, &self.group, &self.path)
    }
}

pub fn artifact_blob_key(job_id: &ResourceId, group: &str, path: &str) -> String {
    format!("artifacts/{job_id}/{group}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::HashAlgorithm;

    #[test]
    fn blob_key_is_stable() {
        let job = ResourceId::new();
        let a = Artifact::new(
            job,
            "dist",
            "bin/app",
            42,
            Digest::new(HashAlgorithm::Sha256, b"x"),
        );
        assert_eq!(a.blob_key(), format!("artifacts/{job}/dist/bin/app"));
    }
}
