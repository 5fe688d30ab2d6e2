//! Build entity: one admitted run of a build definition against a commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::status::BuildStatus;

/// Caller-supplied options for a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Ignore fingerprint matches; every job executes.
    pub force: bool,
    /// Subset of workflow names to run. Empty means all workflows.
    pub workflows: Vec<String>,
}

/// A build: the unit of admission, roll-up, and ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub tenant_id: ResourceId,
    pub repo_id: ResourceId,
    /// Full commit SHA the definition was read from.
    pub commit_sha: String,
    /// Branch or tag name.
    pub ref_name: String,
    pub status: BuildStatus,
    pub error: Option<String>,
    pub opts: BuildOptions,
    /// The current workflow list: workflows whose jobs are eligible for
    /// dequeue when `opts.workflows` restricts the build. Grows
    /// monotonically as eligible jobs pull in dependency workflows; the
    /// default workflow (empty name) is always eligible. Empty when the
    /// build is unrestricted.
    pub workflow_list: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub etag: i64,
}

impl Build {
    pub fn new(
        tenant_id: ResourceId,
        repo_id: ResourceId,
        commit_sha: impl Into<String>,
        ref_name: impl Into<String>,
        opts: BuildOptions,
    ) -> Self {
        let workflow_list = if opts.workflows.is_empty() {
            Vec::new()
        } else {
            // The default workflow rides along with any explicit subset.
            let mut list = opts.workflows.clone();
            if !list.iter().any(String::is_empty) {
                list.push(String::new());
            }
            list
        };
        Self {
            id: ResourceId::new(),
            tenant_id,
            repo_id,
            commit_sha: commit_sha.into(),
            ref_name: ref_name.into(),
            status: BuildStatus::Submitted,
            error: None,
            opts,
            workflow_list,
            created_at: Utc::now(),
            queued_at: None,
            running_at: None,
            finished_at: None,
            canceled_at: None,
            etag: 1,
        }
    }

    /// Whether the build restricts which workflows may run.
    pub fn is_workflow_restricted(&self) -> bool {
        !self.opts.workflows.is_empty()
    }

    /// Whether jobs of `workflow` are currently eligible for dequeue.
    pub fn workflow_eligible(&self, workflow: &str) -> bool {
        if !self.is_workflow_restricted() {
            return true;
        }
        workflow.is_empty() || self.workflow_list.iter().any(|w| w == workflow)
    }

    /// Add a workflow to the current list. Returns true if it was absent.
    pub fn admit_workflow(&mut self, workflow: &str) -> bool {
        if self.workflow_eligible(workflow) {
            return false;
        }
        self.workflow_list.push(workflow.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted(workflows: &[&str]) -> Build {
        Build::new(
            ResourceId::new(),
            ResourceId::new(),
            "deadbeef",
            "main",
            BuildOptions {
                force: false,
                workflows: workflows.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    #[test]
    fn unrestricted_build_admits_everything() {
        let build = restricted(&[]);
        assert!(build.workflow_eligible("deploy"));
        assert!(build.workflow_eligible(""));
    }

    #[test]
    fn restricted_build_admits_subset_and_default() {
        let build = restricted(&["tests"]);
        assert!(build.workflow_eligible("tests"));
        assert!(build.workflow_eligible(""));
        assert!(!build.workflow_eligible("deploy"));
    }

    #[test]
    fn workflow_list_grows_monotonically() {
        let mut build = restricted(&["tests"]);
        assert!(build.admit_workflow("generate"));
        assert!(build.workflow_eligible("generate"));
        // Second admission is a no-op.
        assert!(!build.admit_workflow("generate"));
    }
}
