//! Job-name and dependency reference grammars.
//!
//! Job names: `([workflow].)?jobname`, where an absent workflow means the
//! default workflow.
//!
//! Dependencies come in a canonical and a shorthand form:
//!
//! ```text
//! canonical: [workflow.W.]jobs.J[.artifacts[.A]]
//! shorthand: [W.]J[.artifacts]
//! ```
//!
//! The canonical form wins on ambiguity (`jobs.foo` is a same-workflow
//! reference to job `foo`, not a job `foo` in a workflow named `jobs`).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use conveyor_core::job::ArtifactSelector;

use crate::{ConfigError, ConfigResult};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap());

/// Whether `name` is a legal workflow, job, step, or artifact-group name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Parse `([workflow].)?jobname`. Returns (workflow, job); `None` workflow
/// means the default workflow.
pub fn parse_job_name(input: &str) -> ConfigResult<(Option<String>, String)> {
    let bad = |msg: &str| ConfigError::InvalidValue {
        field: "job name".to_string(),
        message: format!("{input:?}: {msg}"),
    };
    match input.split('.').collect::<Vec<_>>().as_slice() {
        [job] => {
            if !is_valid_name(job) {
                return Err(bad("illegal characters"));
            }
            Ok((None, job.to_string()))
        }
        [workflow, job] => {
            if !is_valid_name(workflow) || !is_valid_name(job) {
                return Err(bad("illegal characters"));
            }
            Ok((Some(workflow.to_string()), job.to_string()))
        }
        _ => Err(bad("expected at most one dot")),
    }
}

/// A textual dependency reference, not yet resolved to a job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    /// Target workflow. `None` means the declaring job's workflow.
    pub workflow: Option<String>,
    pub job: String,
    pub artifacts: Option<ArtifactSelector>,
}

impl DependencyRef {
    pub fn parse(input: &str) -> ConfigResult<DependencyRef> {
        let segments: Vec<&str> = input.split('.').collect();
        let invalid = || ConfigError::InvalidReference(input.to_string());

        // Canonical forms first; they win on ambiguity.
        let (workflow, rest): (Option<String>, &[&str]) = match segments.as_slice() {
            ["workflow", w, rest @ ..] if rest.first() == Some(&"jobs") => {
                (Some(w.to_string()), rest)
            }
            rest @ ["jobs", ..] => (None, rest),
            _ => {
                // Shorthand: [W.]J[.artifacts]
                let parsed = match segments.as_slice() {
                    [job] => DependencyRef {
                        workflow: None,
                        job: job.to_string(),
                        artifacts: None,
                    },
                    [job, "artifacts"] => DependencyRef {
                        workflow: None,
                        job: job.to_string(),
                        artifacts: Some(ArtifactSelector::All),
                    },
                    [workflow, job] => DependencyRef {
                        workflow: Some(workflow.to_string()),
                        job: job.to_string(),
                        artifacts: None,
                    },
                    [workflow, job, "artifacts"] => DependencyRef {
                        workflow: Some(workflow.to_string()),
                        job: job.to_string(),
                        artifacts: Some(ArtifactSelector::All),
                    },
                    _ => return Err(invalid()),
                };
                return parsed.validated(input);
            }
        };

        // rest is ["jobs", J, ...artifact tail]
        let (job, tail) = match rest {
            ["jobs", job, tail @ ..] => (job.to_string(), tail),
            _ => return Err(invalid()),
        };
        let artifacts = match tail {
            [] => None,
            ["artifacts"] => Some(ArtifactSelector::All),
            ["artifacts", group] => Some(ArtifactSelector::Group(group.to_string())),
            _ => return Err(invalid()),
        };
        DependencyRef {
            workflow,
            job,
            artifacts,
        }
        .validated(input)
    }

    fn validated(self, input: &str) -> ConfigResult<DependencyRef> {
        let invalid = || ConfigError::InvalidReference(input.to_string());
        if !is_valid_name(&self.job) {
            return Err(invalid());
        }
        if let Some(w) = &self.workflow {
            if !is_valid_name(w) {
                return Err(invalid());
            }
        }
        if let Some(ArtifactSelector::Group(g)) = &self.artifacts {
            if !is_valid_name(g) {
                return Err(invalid());
            }
        }
        Ok(self)
    }
}

impl std::fmt::Display for DependencyRef {
    /// Canonical form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(w) = &self.workflow {
            write!(f, "workflow.{w}.")?;
        }
        write!(f, "jobs.{}", self.job)?;
        match &self.artifacts {
            None => Ok(()),
            Some(ArtifactSelector::All) => write!(f, ".artifacts"),
            Some(ArtifactSelector::Group(g)) => write!(f, ".artifacts.{g}"),
        }
    }
}
