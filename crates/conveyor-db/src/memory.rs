//! In-memory backend: the test vehicle and the single-process deployment
//! story. Every operation is atomic under one lock, which also makes the
//! etag compare-and-swap semantics exact.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Mutex;

use conveyor_core::access::{AccessFilter, Grant, Identity, Subject};
use conveyor_core::artifact::Artifact;
use conveyor_core::build::Build;
use conveyor_core::event::{NewQueueEvent, QueueEvent};
use conveyor_core::job::{FingerprintKey, Job, Step};
use conveyor_core::log::LogDescriptor;
use conveyor_core::query::{CompareOp, Page, Query, SortDirection};
use conveyor_core::runner::Runner;
use conveyor_core::store::BlobStore;
use conveyor_core::{ETAG_ANY, Error, ResourceId};

use crate::repo::{
    ArtifactRepo, BuildRepo, EventRepo, FingerprintRepo, GrantRepo, JobRepo, LogRepo, RunnerRepo,
    StepRepo,
};
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    builds: HashMap<ResourceId, Build>,
    jobs: HashMap<ResourceId, Job>,
    steps: HashMap<ResourceId, Step>,
    artifacts: HashMap<ResourceId, Artifact>,
    artifact_keys: HashSet<(ResourceId, String, String)>,
    fingerprints: HashMap<FingerprintKey, ResourceId>,
    grants: Vec<Grant>,
    group_members: HashMap<ResourceId, HashSet<ResourceId>>,
    owners: HashMap<ResourceId, ResourceId>,
    runners: HashMap<ResourceId, Runner>,
    descriptors: HashMap<ResourceId, LogDescriptor>,
    events: HashMap<ResourceId, Vec<QueueEvent>>,
}

/// In-memory implementation of every repository trait.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Lock poisoning only happens after a panic mid-update; there is
        // no salvageable state at that point.
        self.state.lock().expect("memory store lock poisoned")
    }
}

fn check_etag(what: impl Into<String>, current: i64, expected: i64) -> DbResult<()> {
    if expected != ETAG_ANY && expected != current {
        return Err(DbError::Stale(what.into()));
    }
    Ok(())
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_build(&self, build: &Build, jobs: &[Job], steps: &[Step]) -> DbResult<()> {
        let mut state = self.lock();
        if state.builds.contains_key(&build.id) {
            return Err(DbError::Duplicate(format!("build {}", build.id)));
        }
        state.builds.insert(build.id, build.clone());
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        self.lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))
    }

    async fn update_build(&self, build: &Build, expected_etag: i64) -> DbResult<Build> {
        let mut state = self.lock();
        let current = state
            .builds
            .get(&build.id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", build.id)))?
            .etag;
        check_etag(format!("build {}", build.id), current, expected_etag)?;
        let mut updated = build.clone();
        updated.etag = current + 1;
        state.builds.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn list_builds(
        &self,
        tenant_id: ResourceId,
        filter: &AccessFilter,
        query: &Query,
        page: &Page,
    ) -> DbResult<Vec<Build>> {
        let state = self.lock();
        let mut matches: Vec<Build> = state
            .builds
            .values()
            .filter(|b| b.tenant_id == tenant_id)
            .filter(|b| filter.permits(&b.id))
            .filter(|b| build_matches(b, query))
            .cloned()
            .collect();

        let sort = query.effective_sort();
        matches.sort_by(|a, b| {
            let ord = sort_key(a, &sort.field)
                .cmp(&sort_key(b, &sort.field))
                .then_with(|| a.id.cmp(&b.id));
            match sort.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            }
        });

        if let Some(cursor) = &page.cursor {
            let boundary = (cursor.boundary_value.clone(), cursor.boundary_id.clone());
            matches.retain(|b| {
                let key = (sort_key(b, &sort.field), b.id.to_string());
                match sort.direction {
                    SortDirection::Asc => key > boundary,
                    SortDirection::Desc => key < boundary,
                }
            });
        }

        matches.truncate(page.effective_limit());
        Ok(matches)
    }
}

fn sort_key(build: &Build, field: &str) -> String {
    match field {
        "ref" => build.ref_name.clone(),
        "commit" => build.commit_sha.clone(),
        "status" => build.status.as_str().to_string(),
        // created_at and anything unrecognized sort by creation time;
        // RFC 3339 strings order the same way the timestamps do.
        _ => build.created_at.to_rfc3339(),
    }
}

fn build_matches(build: &Build, query: &Query) -> bool {
    if let Some(kind) = &query.kind {
        if kind != "build" {
            return false;
        }
    }
    if let Some(term) = &query.term {
        let fields: [(&str, &str); 2] = [
            ("commit", build.commit_sha.as_str()),
            ("ref", build.ref_name.as_str()),
        ];
        let hit = fields
            .iter()
            .filter(|(name, _)| {
                query.in_fields.is_empty() || query.in_fields.iter().any(|f| f == name)
            })
            .any(|(_, value)| value.contains(term.as_str()));
        if !hit {
            return false;
        }
    }
    query
        .filters
        .iter()
        .all(|f| compare(&sort_key(build, &f.field), f.op, &f.value))
}

/// Compare numerically when both sides parse as integers, else as strings.
fn compare(actual: &str, op: CompareOp, expected: &str) -> bool {
    let ord = match (actual.parse::<i128>(), expected.parse::<i128>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => actual.cmp(expected),
    };
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

#[async_trait]
impl JobRepo for MemoryStore {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    async fn insert_jobs(&self, jobs: &[Job], steps: &[Step]) -> DbResult<()> {
        let mut state = self.lock();
        for job in jobs {
            if state.jobs.contains_key(&job.id) {
                return Err(DbError::Duplicate(format!("job {}", job.id)));
            }
        }
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn update_job(&self, job: &Job, expected_etag: i64) -> DbResult<Job> {
        let mut state = self.lock();
        let current = state
            .jobs
            .get(&job.id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job.id)))?
            .etag;
        check_etag(format!("job {}", job.id), current, expected_etag)?;
        let mut updated = job.clone();
        updated.etag = current + 1;
        state.jobs.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn jobs_for_build(&self, build_id: ResourceId) -> DbResult<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.build_id == build_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn queued_jobs(&self, tenant_id: ResourceId) -> DbResult<Vec<Job>> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| {
                j.status == conveyor_core::status::JobStatus::Queued
                    && j.indirect_to_job.is_none()
                    && state
                        .builds
                        .get(&j.build_id)
                        .is_some_and(|b| b.tenant_id == tenant_id)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }
}

#[async_trait]
impl StepRepo for MemoryStore {
    async fn get_step(&self, id: ResourceId) -> DbResult<Step> {
        self.lock()
            .steps
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("step {id}")))
    }

    async fn update_step(&self, step: &Step, expected_etag: i64) -> DbResult<Step> {
        let mut state = self.lock();
        let current = state
            .steps
            .get(&step.id)
            .ok_or_else(|| DbError::NotFound(format!("step {}", step.id)))?
            .etag;
        check_etag(format!("step {}", step.id), current, expected_etag)?;
        let mut updated = step.clone();
        updated.etag = current + 1;
        state.steps.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn steps_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>> {
        let state = self.lock();
        let mut steps: Vec<Step> = state
            .steps
            .values()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(steps)
    }
}

#[async_trait]
impl ArtifactRepo for MemoryStore {
    async fn insert_artifact(&self, artifact: &Artifact) -> DbResult<()> {
        let mut state = self.lock();
        let key = (
            artifact.job_id,
            artifact.group.clone(),
            artifact.path.clone(),
        );
        if !state.artifact_keys.insert(key) {
            return Err(DbError::Duplicate(format!(
                "artifact {}/{}/{}",
                artifact.job_id, artifact.group, artifact.path
            )));
        }
        state.artifacts.insert(artifact.id, artifact.clone());
        Ok(())
    }

    async fn artifacts_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Artifact>> {
        let state = self.lock();
        let mut artifacts: Vec<Artifact> = state
            .artifacts
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        artifacts.sort_by(|a, b| a.group.cmp(&b.group).then(a.path.cmp(&b.path)));
        Ok(artifacts)
    }
}

#[async_trait]
impl FingerprintRepo for MemoryStore {
    async fn upsert_fingerprint(&self, key: &FingerprintKey, job_id: ResourceId) -> DbResult<()> {
        self.lock().fingerprints.insert(key.clone(), job_id);
        Ok(())
    }

    async fn lookup_fingerprint(&self, key: &FingerprintKey) -> DbResult<Option<ResourceId>> {
        Ok(self.lock().fingerprints.get(key).copied())
    }
}

#[async_trait]
impl GrantRepo for MemoryStore {
    async fn insert_grant(&self, grant: &Grant) -> DbResult<()> {
        self.lock().grants.push(grant.clone());
        Ok(())
    }

    async fn grants_for_identity(
        &self,
        identity: Identity,
        groups: &HashSet<ResourceId>,
    ) -> DbResult<Vec<Grant>> {
        let state = self.lock();
        Ok(state
            .grants
            .iter()
            .filter(|g| match g.subject {
                Subject::Identity(id) => id == identity.0,
                Subject::Group(id) => groups.contains(&id),
            })
            .cloned()
            .collect())
    }

    async fn groups_for_identity(&self, identity: Identity) -> DbResult<HashSet<ResourceId>> {
        let state = self.lock();
        Ok(state
            .group_members
            .iter()
            .filter(|(_, members)| members.contains(&identity.0))
            .map(|(group, _)| *group)
            .collect())
    }

    async fn add_group_member(&self, group: ResourceId, identity: Identity) -> DbResult<()> {
        self.lock()
            .group_members
            .entry(group)
            .or_default()
            .insert(identity.0);
        Ok(())
    }

    async fn record_owner(&self, resource: ResourceId, owner: Identity) -> DbResult<()> {
        self.lock().owners.insert(resource, owner.0);
        Ok(())
    }

    async fn owner_of(&self, resource: ResourceId) -> DbResult<Option<ResourceId>> {
        Ok(self.lock().owners.get(&resource).copied())
    }

    async fn resources_owned_by(&self, owner: Identity) -> DbResult<HashSet<ResourceId>> {
        let state = self.lock();
        Ok(state
            .owners
            .iter()
            .filter(|(_, o)| **o == owner.0)
            .map(|(r, _)| *r)
            .collect())
    }
}

#[async_trait]
impl RunnerRepo for MemoryStore {
    async fn insert_runner(&self, runner: &Runner) -> DbResult<()> {
        let mut state = self.lock();
        if state
            .runners
            .values()
            .any(|r| r.key_fingerprint == runner.key_fingerprint)
        {
            return Err(DbError::Duplicate(format!(
                "runner key {}",
                runner.key_fingerprint
            )));
        }
        state.runners.insert(runner.id, runner.clone());
        Ok(())
    }

    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner> {
        self.lock()
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("runner {id}")))
    }

    async fn runner_by_key(&self, key_fingerprint: &str) -> DbResult<Option<Runner>> {
        Ok(self
            .lock()
            .runners
            .values()
            .find(|r| r.key_fingerprint == key_fingerprint)
            .cloned())
    }

    async fn update_runner(&self, runner: &Runner, expected_etag: i64) -> DbResult<Runner> {
        let mut state = self.lock();
        let current = state
            .runners
            .get(&runner.id)
            .ok_or_else(|| DbError::NotFound(format!("runner {}", runner.id)))?
            .etag;
        check_etag(format!("runner {}", runner.id), current, expected_etag)?;
        let mut updated = runner.clone();
        updated.etag = current + 1;
        state.runners.insert(updated.id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl LogRepo for MemoryStore {
    async fn insert_descriptor(&self, descriptor: &LogDescriptor) -> DbResult<()> {
        let mut state = self.lock();
        if state.descriptors.contains_key(&descriptor.id) {
            return Err(DbError::Duplicate(format!("log {}", descriptor.id)));
        }
        state.descriptors.insert(descriptor.id, descriptor.clone());
        Ok(())
    }

    async fn get_descriptor(&self, id: ResourceId) -> DbResult<LogDescriptor> {
        self.lock()
            .descriptors
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("log {id}")))
    }

    async fn descriptor_for_subject(
        &self,
        subject_id: ResourceId,
    ) -> DbResult<Option<LogDescriptor>> {
        Ok(self
            .lock()
            .descriptors
            .values()
            .find(|d| d.subject_id == subject_id)
            .cloned())
    }

    async fn children_of(&self, id: ResourceId) -> DbResult<Vec<LogDescriptor>> {
        let state = self.lock();
        let mut children: Vec<LogDescriptor> = state
            .descriptors
            .values()
            .filter(|d| d.parent_id == Some(id))
            .cloned()
            .collect();
        children.sort_by_key(|d| d.id);
        Ok(children)
    }

    async fn update_descriptor(
        &self,
        descriptor: &LogDescriptor,
        expected_etag: i64,
    ) -> DbResult<LogDescriptor> {
        let mut state = self.lock();
        let current = state
            .descriptors
            .get(&descriptor.id)
            .ok_or_else(|| DbError::NotFound(format!("log {}", descriptor.id)))?
            .etag;
        check_etag(format!("log {}", descriptor.id), current, expected_etag)?;
        let mut updated = descriptor.clone();
        updated.etag = current + 1;
        state.descriptors.insert(updated.id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn append_event(&self, event: NewQueueEvent) -> DbResult<QueueEvent> {
        let mut state = self.lock();
        let feed = state.events.entry(event.build_id).or_default();
        let seq = feed.last().map_or(1, |e| e.seq + 1);
        let stored = QueueEvent {
            seq,
            build_id: event.build_id,
            kind: event.kind,
            subject_id: event.subject_id,
            subject_name: event.subject_name,
            status: event.status,
            at: Utc::now(),
        };
        feed.push(stored.clone());
        Ok(stored)
    }

    async fn events_after(
        &self,
        build_id: ResourceId,
        after_seq: u64,
        limit: usize,
    ) -> DbResult<Vec<QueueEvent>> {
        let state = self.lock();
        Ok(state
            .events
            .get(&build_id)
            .map(|feed| {
                feed.iter()
                    .filter(|e| e.seq > after_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory blob store over a sorted map, so prefix listing matches the
/// lexicographic contract exactly.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> conveyor_core::Result<()> {
        self.blobs
            .lock()
            .map_err(|_| Error::Transport("blob store lock poisoned".to_string()))?
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> conveyor_core::Result<Option<Bytes>> {
        Ok(self
            .blobs
            .lock()
            .map_err(|_| Error::Transport("blob store lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    async fn list_prefix(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> conveyor_core::Result<Vec<String>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| Error::Transport("blob store lock poisoned".to_string()))?;
        let start = match after {
            Some(k) => Bound::Excluded(k.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        Ok(blobs
            .range((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> conveyor_core::Result<()> {
        self.blobs
            .lock()
            .map_err(|_| Error::Transport("blob store lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}
