//! Queue events: the per-build feed consumed by dynamic-job submitters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// What happened. Delivery is ordered per build; there is no cross-build
/// ordering guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    JobAdded,
    JobStatusChanged,
    StepStatusChanged,
    LogSealed,
}

impl QueueEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventKind::JobAdded => "job_added",
            QueueEventKind::JobStatusChanged => "job_status_changed",
            QueueEventKind::StepStatusChanged => "step_status_changed",
            QueueEventKind::LogSealed => "log_sealed",
        }
    }
}

impl std::str::FromStr for QueueEventKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "job_added" => Ok(QueueEventKind::JobAdded),
            "job_status_changed" => Ok(QueueEventKind::JobStatusChanged),
            "step_status_changed" => Ok(QueueEventKind::StepStatusChanged),
            "log_sealed" => Ok(QueueEventKind::LogSealed),
            other => Err(crate::Error::ValidationFailed(format!(
                "unknown event kind {other:?}"
            ))),
        }
    }
}

/// A persisted queue event. `seq` is monotonic within the build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub seq: u64,
    pub build_id: ResourceId,
    pub kind: QueueEventKind,
    /// The job, step, or log descriptor the event is about.
    pub subject_id: ResourceId,
    /// Qualified name of the subject, when it has one.
    pub subject_name: Option<String>,
    /// New status as a string, for status-change events.
    pub status: Option<String>,
    pub at: DateTime<Utc>,
}

/// An event not yet assigned its sequence number.
#[derive(Debug, Clone)]
pub struct NewQueueEvent {
    pub build_id: ResourceId,
    pub kind: QueueEventKind,
    pub subject_id: ResourceId,
    pub subject_name: Option<String>,
    pub status: Option<String>,
}

impl NewQueueEvent {
    pub fn new(build_id: ResourceId, kind: QueueEventKind, subject_id: ResourceId) -> Self {
        Self {
            build_id,
            kind,
            subject_id,
            subject_name: None,
            status: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.subject_name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Sink for emitting queue events, implemented by the event broker.
/// Components that are not the queue engine (the log seal path) publish
/// through this seam.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: NewQueueEvent) -> Result<QueueEvent>;
}
