//! Fingerprint indirection and artifact verification.
//!
//! The index maps (tenant, workflow, job name, algorithm, fingerprint) to
//! the most recent succeeded job bearing that key. An indirection is only
//! honored after every declared artifact of the prior job is re-verified
//! against the blob store: present at the expected key, expected size,
//! expected content hash.

use sha2::{Digest as _, Sha256};
use std::sync::Arc;
use tracing::debug;

use conveyor_core::job::{ArtifactSelector, HashAlgorithm};
use conveyor_core::store::BlobStore;
use conveyor_core::{ResourceId, Result};
use conveyor_db::ArtifactRepo;

/// Verify the artifacts of `job_id`, optionally restricted to a selector.
/// Returns false on any missing blob, size mismatch, or digest mismatch.
pub async fn verify_artifacts(
    store: &dyn ArtifactRepo,
    blobs: &Arc<dyn BlobStore>,
    job_id: ResourceId,
    selector: Option<&ArtifactSelector>,
) -> Result<bool> {
    let artifacts = store.artifacts_for_job(job_id).await?;
    let selected = artifacts.iter().filter(|a| match selector {
        None | Some(ArtifactSelector::All) => true,
        Some(ArtifactSelector::Group(group)) => a.group == *group,
    });

    for artifact in selected {
        let key = artifact.blob_key();
        let Some(bytes) = blobs.get(&key).await? else {
            debug!(%job_id, key, "artifact blob missing");
            return Ok(false);
        };
        if bytes.len() as u64 != artifact.size {
            debug!(%job_id, key, "artifact size mismatch");
            return Ok(false);
        }
        if !digest_matches(&artifact.digest, &bytes) {
            debug!(%job_id, key, "artifact digest mismatch");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Artifacts are digested with SHA-256; any other algorithm tag cannot be
/// recomputed here and fails verification.
pub fn digest_matches(digest: &conveyor_core::job::Digest, bytes: &[u8]) -> bool {
    match digest.algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)) == digest.hex,
        HashAlgorithm::Sha1 => false,
    }
}

/// Compute the SHA-256 digest of artifact content.
pub fn sha256_digest(bytes: &[u8]) -> conveyor_core::job::Digest {
    conveyor_core::job::Digest {
        algorithm: HashAlgorithm::Sha256,
        hex: hex::encode(Sha256::digest(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conveyor_core::artifact::Artifact;
    use conveyor_db::{MemoryBlobStore, MemoryStore};

    #[tokio::test]
    async fn verification_checks_presence_size_and_digest() {
        let store = MemoryStore::new();
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let job = ResourceId::new();

        let content = b"artifact content".to_vec();
        let artifact = Artifact::new(job, "dist", "out.bin", content.len() as u64, sha256_digest(&content));
        store.insert_artifact(&artifact).await.unwrap();

        // Missing blob fails.
        assert!(!verify_artifacts(&store, &blobs, job, None).await.unwrap());

        // Present and matching passes.
        blobs
            .put(&artifact.blob_key(), Bytes::from(content.clone()))
            .await
            .unwrap();
        assert!(verify_artifacts(&store, &blobs, job, None).await.unwrap());

        // Corrupted content fails on the digest.
        blobs
            .put(&artifact.blob_key(), Bytes::from_static(b"artifact CONTENT"))
            .await
            .unwrap();
        assert!(!verify_artifacts(&store, &blobs, job, None).await.unwrap());
    }

    #[tokio::test]
    async fn group_selector_restricts_verification() {
        let store = MemoryStore::new();
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let job = ResourceId::new();

        let good = b"good".to_vec();
        let a = Artifact::new(job, "dist", "good.bin", good.len() as u64, sha256_digest(&good));
        store.insert_artifact(&a).await.unwrap();
        blobs.put(&a.blob_key(), Bytes::from(good)).await.unwrap();

        // A broken artifact in another group does not matter for the
        // selected one.
        let broken = Artifact::new(job, "debug", "missing.bin", 4, sha256_digest(b"gone"));
        store.insert_artifact(&broken).await.unwrap();

        let selector = ArtifactSelector::Group("dist".to_string());
        assert!(
            verify_artifacts(&store, &blobs, job, Some(&selector))
                .await
                .unwrap()
        );
        assert!(!verify_artifacts(&store, &blobs, job, None).await.unwrap());
    }

    #[tokio::test]
    async fn jobs_without_artifacts_verify_vacuously() {
        let store = MemoryStore::new();
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        assert!(
            verify_artifacts(&store, &blobs, ResourceId::new(), None)
                .await
                .unwrap()
        );
    }
}
