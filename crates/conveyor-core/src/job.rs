//! Job and step entities: the nodes of the build graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;
use crate::status::{JobStatus, StepStatus};

/// How a job's commands are executed by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Commands run inside a container image.
    Docker,
    /// Commands run directly on the runner host.
    Exec,
    /// A job whose execution submits further jobs.
    Dynamic,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Docker => "docker",
            JobType::Exec => "exec",
            JobType::Dynamic => "dynamic",
        }
    }
}

/// Execution environment descriptor handed to the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Container image for `docker` jobs.
    pub image: Option<String>,
    /// Environment variables exported to every step.
    pub env: HashMap<String, String>,
}

/// Whether a job's steps run in declared order or per their own deps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecution {
    #[default]
    Parallel,
    Sequential,
}

/// Which artifacts of a dependency job are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSelector {
    /// Every artifact the job produced.
    All,
    /// A single named artifact group.
    Group(String),
}

/// An edge in the build graph.
///
/// `job_id` is filled in when the target job is known; a dependency on a
/// workflow that has not been admitted yet stays textual (deferred) and
/// blocks dequeue but not admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    /// Target workflow name; empty means the declaring job's workflow.
    pub workflow: String,
    pub job_name: String,
    /// Present when this is an artifact dependency.
    pub artifacts: Option<ArtifactSelector>,
    /// Resolved target. None while the reference is deferred.
    pub job_id: Option<ResourceId>,
}

impl JobDependency {
    pub fn is_resolved(&self) -> bool {
        self.job_id.is_some()
    }
}

/// Content-hash algorithms accepted for fingerprints and artifact digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Sha256,
    /// Git object hashes reported by runners that fingerprint via git.
    Sha1,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha1 => "sha1",
        }
    }
}

/// An opaque content digest: algorithm tag plus lowercase hex bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

impl Digest {
    pub fn new(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            hex: hex::encode(bytes),
        }
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Key of the fingerprint indirection index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub tenant_id: ResourceId,
    pub workflow: String,
    pub job_name: String,
    pub digest: Digest,
}

/// Binding of a dequeued job to the runner executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLease {
    pub runner_id: ResourceId,
    pub acquired_at: DateTime<Utc>,
}

/// A job: one unit of dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub build_id: ResourceId,
    /// Workflow name; empty is the default workflow.
    pub workflow: String,
    /// Unique within (build, workflow).
    pub name: String,
    pub job_type: JobType,
    pub runtime: RuntimeSpec,
    pub step_execution: StepExecution,
    pub depends: Vec<JobDependency>,
    pub fingerprint: Option<Digest>,
    /// A prior succeeded job whose outputs stand in for this one.
    pub indirect_to_job: Option<ResourceId>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub lease: Option<JobLease>,
    /// Set when the build was canceled while this job was leased; the
    /// runner learns about it from its next status-update response.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub etag: i64,
}

impl Job {
    /// `workflow.name`, or just `name` for the default workflow.
    pub fn qualified_name(&self) -> String {
        if self.workflow.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.workflow, self.name)
        }
    }

    /// Whether any dependency is still a textual (deferred) reference.
    pub fn has_deferred_dependency(&self) -> bool {
        self.depends.iter().any(|d| !d.is_resolved())
    }
}

/// A step: one ordered command sequence within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: ResourceId,
    pub job_id: ResourceId,
    /// Unique within the job.
    pub name: String,
    pub commands: Vec<String>,
    /// Names of steps in the same job that must finish first.
    pub depends: Vec<String>,
    pub status: StepStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub etag: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_name_elides_default_workflow() {
        let mut job = Job {
            id: ResourceId::new(),
            build_id: ResourceId::new(),
            workflow: String::new(),
            name: "compile".into(),
            job_type: JobType::Docker,
            runtime: RuntimeSpec::default(),
            step_execution: StepExecution::default(),
            depends: vec![],
            fingerprint: None,
            indirect_to_job: None,
            status: JobStatus::Queued,
            error: None,
            lease: None,
            cancel_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            etag: 1,
        };
        assert_eq!(job.qualified_name(), "compile");
        job.workflow = "build".into();
        assert_eq!(job.qualified_name(), "build.compile");
    }

    #[test]
    fn digest_display_carries_algorithm_tag() {
        let d = Digest::new(HashAlgorithm::Sha256, &[0xab, 0xcd]);
        assert_eq!(d.to_string(), "sha256:abcd");
    }
}
