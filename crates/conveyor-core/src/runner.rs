//! Runner entity: a remote executor registered with the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::job::JobType;

/// What a runner is able to execute. Reported at registration and may be
/// updated at any time; downgrades do not revoke existing leases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub os: String,
    pub arch: String,
    pub job_types: Vec<JobType>,
    pub labels: Vec<String>,
}

impl Capabilities {
    pub fn supports(&self, job_type: JobType) -> bool {
        self.job_types.contains(&job_type)
    }
}

/// A registered runner. Authenticates with a client certificate; the
/// public-key fingerprint is the stable credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: ResourceId,
    pub tenant_id: ResourceId,
    pub name: String,
    pub capabilities: Capabilities,
    pub enabled: bool,
    /// SHA-256 fingerprint of the runner's client certificate public key.
    pub key_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub etag: i64,
}

impl Runner {
    pub fn new(
        tenant_id: ResourceId,
        name: impl Into<String>,
        key_fingerprint: impl Into<String>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            tenant_id,
            name: name.into(),
            capabilities,
            enabled: true,
            key_fingerprint: key_fingerprint.into(),
            created_at: Utc::now(),
            etag: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_check() {
        let caps = Capabilities {
            os: "linux".into(),
            arch: "amd64".into(),
            job_types: vec![JobType::Docker, JobType::Dynamic],
            labels: vec![],
        };
        assert!(caps.supports(JobType::Docker));
        assert!(!caps.supports(JobType::Exec));
    }
}
