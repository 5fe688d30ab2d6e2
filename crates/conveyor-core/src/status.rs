//! Status state machines for builds, jobs, and steps.

use serde::{Deserialize, Serialize};

/// Overall build status, derived from job statuses by roll-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Accepted but not yet admitted to the queue.
    Submitted,
    /// Admitted; jobs are eligible for dequeue.
    Queued,
    /// At least one job has started running.
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Submitted => "submitted",
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Canceled => "canceled",
        }
    }
}

/// Job status. Transitions are enforced by [`JobStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dependencies and a runner.
    Queued,
    /// Leased to a runner, not yet started.
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Legal transitions:
    ///
    /// ```text
    /// queued    -> submitted | canceled
    /// submitted -> running | failed | canceled
    /// running   -> succeeded | failed | canceled
    /// ```
    ///
    /// Terminal statuses admit no further transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Submitted)
                | (Queued, Canceled)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Submitted, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

/// Step status mirrors the job FSM, but a terminal step does not by itself
/// terminate the enclosing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Queued, Submitted)
                | (Queued, Canceled)
                | (Submitted, Running)
                | (Submitted, Failed)
                | (Submitted, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Submitted => "submitted",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Canceled => "canceled",
        }
    }
}
