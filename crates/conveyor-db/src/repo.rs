//! Repository traits: the minimal structured-row operations the core
//! consumes. Concrete backends (PostgreSQL, in-memory) are injected.
//!
//! Mutating operations take the etag the caller read and fail with
//! [`DbError::Stale`] when it no longer matches; [`ETAG_ANY`] is accepted
//! only for server-internal refreshes. Multi-row creations are atomic
//! within one backend transaction.

use async_trait::async_trait;
use std::collections::HashSet;

use conveyor_core::ResourceId;
use conveyor_core::access::{AccessFilter, Grant, Identity};
use conveyor_core::artifact::Artifact;
use conveyor_core::build::Build;
use conveyor_core::event::{NewQueueEvent, QueueEvent};
use conveyor_core::job::{FingerprintKey, Job, Step};
use conveyor_core::log::LogDescriptor;
use conveyor_core::query::{Page, Query};
use conveyor_core::runner::Runner;

use crate::DbResult;

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Persist a build with its whole job graph, atomically.
    async fn create_build(&self, build: &Build, jobs: &[Job], steps: &[Step]) -> DbResult<()>;

    async fn get_build(&self, id: ResourceId) -> DbResult<Build>;

    /// Compare-and-swap on `expected_etag`; returns the stored build with
    /// its etag bumped.
    async fn update_build(&self, build: &Build, expected_etag: i64) -> DbResult<Build>;

    /// Search builds of a tenant, restricted by the caller's access filter.
    async fn list_builds(
        &self,
        tenant_id: ResourceId,
        filter: &AccessFilter,
        query: &Query,
        page: &Page,
    ) -> DbResult<Vec<Build>>;
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;

    /// Append jobs (and their steps) to an existing build, atomically.
    async fn insert_jobs(&self, jobs: &[Job], steps: &[Step]) -> DbResult<()>;

    async fn update_job(&self, job: &Job, expected_etag: i64) -> DbResult<Job>;

    async fn jobs_for_build(&self, build_id: ResourceId) -> DbResult<Vec<Job>>;

    /// Queued, non-indirected jobs across the tenant's active builds, in
    /// FIFO order. The dequeue candidate scan.
    async fn queued_jobs(&self, tenant_id: ResourceId) -> DbResult<Vec<Job>>;
}

#[async_trait]
pub trait StepRepo: Send + Sync {
    async fn get_step(&self, id: ResourceId) -> DbResult<Step>;
    async fn update_step(&self, step: &Step, expected_etag: i64) -> DbResult<Step>;
    async fn steps_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>>;
}

#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    /// `(job, group, path)` is unique; violations fail with `Duplicate`.
    async fn insert_artifact(&self, artifact: &Artifact) -> DbResult<()>;
    async fn artifacts_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Artifact>>;
}

#[async_trait]
pub trait FingerprintRepo: Send + Sync {
    /// Point the key at `job_id`, replacing any older entry.
    async fn upsert_fingerprint(&self, key: &FingerprintKey, job_id: ResourceId) -> DbResult<()>;
    async fn lookup_fingerprint(&self, key: &FingerprintKey) -> DbResult<Option<ResourceId>>;
}

#[async_trait]
pub trait GrantRepo: Send + Sync {
    async fn insert_grant(&self, grant: &Grant) -> DbResult<()>;

    /// Grants whose subject is the identity itself or any of `groups`.
    async fn grants_for_identity(
        &self,
        identity: Identity,
        groups: &HashSet<ResourceId>,
    ) -> DbResult<Vec<Grant>>;

    async fn groups_for_identity(&self, identity: Identity) -> DbResult<HashSet<ResourceId>>;

    async fn add_group_member(&self, group: ResourceId, identity: Identity) -> DbResult<()>;

    /// Record the creator of a resource; creators hold every operation.
    async fn record_owner(&self, resource: ResourceId, owner: Identity) -> DbResult<()>;

    async fn owner_of(&self, resource: ResourceId) -> DbResult<Option<ResourceId>>;

    async fn resources_owned_by(&self, owner: Identity) -> DbResult<HashSet<ResourceId>>;
}

#[async_trait]
pub trait RunnerRepo: Send + Sync {
    /// `key_fingerprint` is unique; violations fail with `Duplicate`.
    async fn insert_runner(&self, runner: &Runner) -> DbResult<()>;
    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner>;
    async fn runner_by_key(&self, key_fingerprint: &str) -> DbResult<Option<Runner>>;
    async fn update_runner(&self, runner: &Runner, expected_etag: i64) -> DbResult<Runner>;
}

#[async_trait]
pub trait LogRepo: Send + Sync {
    async fn insert_descriptor(&self, descriptor: &LogDescriptor) -> DbResult<()>;
    async fn get_descriptor(&self, id: ResourceId) -> DbResult<LogDescriptor>;
    async fn descriptor_for_subject(&self, subject_id: ResourceId)
    -> DbResult<Option<LogDescriptor>>;
    async fn children_of(&self, id: ResourceId) -> DbResult<Vec<LogDescriptor>>;
    async fn update_descriptor(
        &self,
        descriptor: &LogDescriptor,
        expected_etag: i64,
    ) -> DbResult<LogDescriptor>;
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    /// Assign the next per-build sequence number and persist the event.
    async fn append_event(&self, event: NewQueueEvent) -> DbResult<QueueEvent>;

    /// Events with `seq > after_seq`, ascending, at most `limit`.
    async fn events_after(
        &self,
        build_id: ResourceId,
        after_seq: u64,
        limit: usize,
    ) -> DbResult<Vec<QueueEvent>>;
}

/// The full capability set the queue engine and log pipeline consume.
pub trait Datastore:
    BuildRepo
    + JobRepo
    + StepRepo
    + ArtifactRepo
    + FingerprintRepo
    + GrantRepo
    + RunnerRepo
    + LogRepo
    + EventRepo
{
}

impl<T> Datastore for T where
    T: BuildRepo
        + JobRepo
        + StepRepo
        + ArtifactRepo
        + FingerprintRepo
        + GrantRepo
        + RunnerRepo
        + LogRepo
        + EventRepo
{
}
