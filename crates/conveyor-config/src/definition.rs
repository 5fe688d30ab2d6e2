//! The build graph skeleton produced by the parser.
//!
//! Dependencies are still textual references at this stage; the queue
//! engine resolves them to job ids at admission.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use conveyor_core::job::{JobType, StepExecution};

use crate::reference::DependencyRef;

/// A parsed build definition: one or more workflows of jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDefinition {
    pub version: u32,
    pub workflows: Vec<WorkflowDef>,
}

impl BuildDefinition {
    /// Total number of jobs across all workflows.
    pub fn job_count(&self) -> usize {
        self.workflows.iter().map(|w| w.jobs.len()).sum()
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowDef> {
        self.workflows.iter().find(|w| w.name == name)
    }
}

/// A named group of jobs. The empty name is the default workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    pub jobs: Vec<JobDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    pub job_type: JobType,
    /// Container image for `docker` jobs.
    pub image: Option<String>,
    pub env: HashMap<String, String>,
    pub step_execution: StepExecution,
    pub depends: Vec<DependencyRef>,
    pub steps: Vec<StepDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    pub commands: Vec<String>,
    /// Names of steps in the same job that must finish first.
    pub depends: Vec<String>,
}
