//! The queue engine: admission, dependency tracking, dequeue, status
//! transitions, fingerprint indirection, and dynamic job insertion.
//!
//! Every mutation is a short read-modify-write guarded by the etag the
//! caller (or the engine itself) read; concurrent pullers and submitters
//! serialize on the store's compare-and-swap. Delivery is at-least-once
//! with idempotent application, never exactly-once.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use conveyor_config::{BuildDefinition, ConfigFormat, JobDef, TemplateContext, parse_job_name};
use conveyor_core::access::{self, AccessFilter, Identity, Operation};
use conveyor_core::artifact::{Artifact, artifact_blob_key};
use conveyor_core::build::{Build, BuildOptions};
use conveyor_core::event::{NewQueueEvent, QueueEventKind};
use conveyor_core::job::{
    Digest, FingerprintKey, Job, JobDependency, JobLease, RuntimeSpec, Step,
};
use conveyor_core::log::LogDescriptor;
use conveyor_core::query::{Page, Query};
use conveyor_core::status::{BuildStatus, JobStatus, StepStatus};
use conveyor_core::store::BlobStore;
use conveyor_core::{Error, ResourceId, Result, limits};
use conveyor_db::Datastore;

use crate::events::EventBroker;
use crate::fingerprint::{digest_matches, verify_artifacts};
use crate::session::RunnerRegistry;

/// Attempts at an engine-internal compare-and-swap before giving up.
const CAS_RETRIES: usize = 5;

/// Request body for build admission.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub tenant_id: ResourceId,
    pub repo_id: ResourceId,
    pub commit_sha: String,
    pub ref_name: String,
    pub opts: BuildOptions,
    pub config: Vec<u8>,
    pub format: ConfigFormat,
    pub env: HashMap<String, String>,
}

/// A build with its full job graph.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    pub build: Build,
    pub jobs: Vec<JobGraph>,
}

#[derive(Debug, Clone)]
pub struct JobGraph {
    pub job: Job,
    pub steps: Vec<Step>,
}

/// One dequeued unit of work.
#[derive(Debug, Clone)]
pub struct RunnableJob {
    pub job: Job,
    pub steps: Vec<Step>,
}

/// Outcome of a status or fingerprint update. `cancel_requested` tells the
/// runner to abandon the job; cancellation propagates through this
/// response rather than any push channel.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: Job,
    pub cancel_requested: bool,
}

pub struct QueueEngine {
    store: Arc<dyn Datastore>,
    blobs: Arc<dyn BlobStore>,
    events: Arc<EventBroker>,
    sessions: Arc<RunnerRegistry>,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        blobs: Arc<dyn BlobStore>,
        events: Arc<EventBroker>,
        sessions: Arc<RunnerRegistry>,
    ) -> Self {
        Self {
            store,
            blobs,
            events,
            sessions,
        }
    }

    /// Pre-admission size guard, also applied inside the parser.
    pub fn check_build_config_length(&self, len: usize) -> Result<()> {
        let max = limits().max_config_bytes;
        if len > max {
            return Err(Error::LimitExceeded(format!(
                "config is {len} bytes, maximum is {max}"
            )));
        }
        Ok(())
    }

    /// Parse, validate, and admit a build. The graph is persisted with
    /// status `queued` and a `JobAdded` event per job.
    pub async fn enqueue_build(
        &self,
        identity: Identity,
        request: EnqueueRequest,
    ) -> Result<BuildGraph> {
        self.check_build_config_length(request.config.len())?;

        let mut build = Build::new(
            request.tenant_id,
            request.repo_id,
            request.commit_sha.clone(),
            request.ref_name.clone(),
            request.opts,
        );
        let ctx = TemplateContext {
            commit_sha: request.commit_sha.clone(),
            ref_name: request.ref_name.clone(),
            build_id: build.id.to_string(),
            tenant: request.tenant_id.to_string(),
            env: request.env,
        };
        let definition = conveyor_config::parse_definition(&request.config, request.format, &ctx)?;

        build.status = BuildStatus::Queued;
        build.queued_at = Some(Utc::now());

        let (jobs, steps) = materialize(&definition, &build)?;
        if let Some(cycle) = find_cycle(&jobs) {
            return Err(Error::ValidationFailed(format!(
                "dependency cycle through {cycle}"
            )));
        }

        self.store.create_build(&build, &jobs, &steps).await?;
        self.store.record_owner(build.id, identity).await?;

        // Log descriptor tree: build root, one child per job, one per step.
        let root = LogDescriptor::new(build.id, None);
        self.store.insert_descriptor(&root).await?;
        for job in &jobs {
            self.store.record_owner(job.id, identity).await?;
            let job_log = LogDescriptor::new(job.id, Some(root.id));
            self.store.insert_descriptor(&job_log).await?;
            for step in steps.iter().filter(|s| s.job_id == job.id) {
                self.store
                    .insert_descriptor(&LogDescriptor::new(step.id, Some(job_log.id)))
                    .await?;
            }
        }

        for job in &jobs {
            self.emit(
                NewQueueEvent::new(build.id, QueueEventKind::JobAdded, job.id)
                    .with_name(job.qualified_name()),
            )
            .await;
        }
        info!(build_id = %build.id, jobs = jobs.len(), "admitted build");

        Ok(assemble_graph(build, jobs, steps))
    }

    /// Return one job whose preconditions all hold, atomically leasing it
    /// to the runner. Concurrent pullers race on the job etag; losers move
    /// on to the next candidate.
    pub async fn dequeue(&self, runner_id: ResourceId) -> Result<Option<RunnableJob>> {
        let session = self.sessions.session(runner_id).ok_or(Error::Unauthorized)?;
        let runner = self.store.get_runner(runner_id).await?;
        if !runner.enabled {
            return Err(Error::AccountDisabled(runner.name.clone()));
        }

        let candidates = self.store.queued_jobs(runner.tenant_id).await?;
        let mut builds: HashMap<ResourceId, Build> = HashMap::new();

        for job in candidates {
            if let Some(pinned) = session.active_build {
                if pinned != job.build_id {
                    // Stale entries from other builds are the caller's to
                    // drain.
                    continue;
                }
            }
            if !runner.capabilities.supports(job.job_type) {
                continue;
            }

            if !builds.contains_key(&job.build_id) {
                let build = self.store.get_build(job.build_id).await?;
                builds.insert(job.build_id, build);
            }
            let build = builds.get_mut(&job.build_id).expect("cached build");
            if !matches!(build.status, BuildStatus::Queued | BuildStatus::Running) {
                continue;
            }
            if build.is_workflow_restricted() {
                self.grow_workflow_list(build).await?;
                if !build.workflow_eligible(&job.workflow) {
                    continue;
                }
            }
            if !self.dependencies_satisfied(&job).await? {
                continue;
            }

            let mut claimed = job.clone();
            claimed.status = JobStatus::Submitted;
            claimed.lease = Some(JobLease {
                runner_id,
                acquired_at: Utc::now(),
            });
            match self.store.update_job(&claimed, job.etag).await {
                Ok(stored) => {
                    self.sessions.record_lease(runner_id, stored.id);
                    self.emit(
                        NewQueueEvent::new(stored.build_id, QueueEventKind::JobStatusChanged, stored.id)
                            .with_name(stored.qualified_name())
                            .with_status(stored.status.as_str()),
                    )
                    .await;
                    let steps = self.store.steps_for_job(stored.id).await?;
                    debug!(job_id = %stored.id, runner_id = %runner_id, "dequeued job");
                    return Ok(Some(RunnableJob { job: stored, steps }));
                }
                // Another puller committed the lease first.
                Err(conveyor_db::DbError::Stale(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Apply a job FSM transition. Only the leasing runner may transition
    /// a leased job. On a terminal transition the finished timestamp is
    /// stamped, the fingerprint index is fed, and the build rolls up.
    pub async fn update_job_status(
        &self,
        identity: Identity,
        job_id: ResourceId,
        new_status: JobStatus,
        error: Option<String>,
        etag: i64,
    ) -> Result<JobUpdate> {
        let job = self.store.get_job(job_id).await?;
        self.authorize_job_mutation(identity, &job).await?;
        let build = self.store.get_build(job.build_id).await?;

        if !job.status.can_transition_to(new_status) {
            return Err(Error::FsmInvalid(format!(
                "job {}: {} -> {}",
                job.id,
                job.status.as_str(),
                new_status.as_str()
            )));
        }

        let now = Utc::now();
        let mut updated = job.clone();
        updated.status = new_status;
        updated.error = error;
        if new_status == JobStatus::Running && updated.started_at.is_none() {
            updated.started_at = Some(now);
        }
        if new_status.is_terminal() {
            updated.finished_at = Some(now);
        }

        let stored = self.store.update_job(&updated, etag).await?;

        if new_status == JobStatus::Succeeded {
            if let Some(digest) = &stored.fingerprint {
                let key = FingerprintKey {
                    tenant_id: build.tenant_id,
                    workflow: stored.workflow.clone(),
                    job_name: stored.name.clone(),
                    digest: digest.clone(),
                };
                self.store.upsert_fingerprint(&key, stored.id).await?;
            }
        }
        if new_status.is_terminal() {
            if let Some(lease) = &stored.lease {
                self.sessions.release_lease(lease.runner_id, stored.id);
            }
        }

        self.emit(
            NewQueueEvent::new(stored.build_id, QueueEventKind::JobStatusChanged, stored.id)
                .with_name(stored.qualified_name())
                .with_status(new_status.as_str()),
        )
        .await;

        let build = self.roll_up_build(stored.build_id).await?;
        let cancel_requested = stored.cancel_requested || build.status == BuildStatus::Canceled;
        Ok(JobUpdate {
            job: stored,
            cancel_requested,
        })
    }

    /// Step transitions mirror the job FSM but never roll up beyond the
    /// job.
    pub async fn update_step_status(
        &self,
        identity: Identity,
        step_id: ResourceId,
        new_status: StepStatus,
        error: Option<String>,
        etag: i64,
    ) -> Result<Step> {
        let step = self.store.get_step(step_id).await?;
        let job = self.store.get_job(step.job_id).await?;
        self.authorize_job_mutation(identity, &job).await?;

        if !step.status.can_transition_to(new_status) {
            return Err(Error::FsmInvalid(format!(
                "step {}: {} -> {}",
                step.id,
                step.status.as_str(),
                new_status.as_str()
            )));
        }

        let now = Utc::now();
        let mut updated = step.clone();
        updated.status = new_status;
        updated.error = error;
        if new_status == StepStatus::Running && updated.started_at.is_none() {
            updated.started_at = Some(now);
        }
        if new_status.is_terminal() {
            updated.finished_at = Some(now);
        }
        let stored = self.store.update_step(&updated, etag).await?;

        self.emit(
            NewQueueEvent::new(job.build_id, QueueEventKind::StepStatusChanged, stored.id)
                .with_name(stored.name.clone())
                .with_status(new_status.as_str()),
        )
        .await;
        Ok(stored)
    }

    /// Record a job's fingerprint and, unless the build is forced, try to
    /// indirect it to a prior succeeded job with the same key. The prior
    /// job's artifacts are re-verified before the indirection is honored;
    /// any failure clears it.
    pub async fn update_job_fingerprint(
        &self,
        identity: Identity,
        job_id: ResourceId,
        digest: Digest,
        etag: i64,
    ) -> Result<JobUpdate> {
        let job = self.store.get_job(job_id).await?;
        self.authorize_job_mutation(identity, &job).await?;
        if job.status.is_terminal() {
            return Err(Error::FsmInvalid(format!(
                "job {} is already {}",
                job.id,
                job.status.as_str()
            )));
        }
        let build = self.store.get_build(job.build_id).await?;

        let mut updated = job.clone();
        updated.fingerprint = Some(digest.clone());
        updated.indirect_to_job = None;

        if !build.opts.force {
            let key = FingerprintKey {
                tenant_id: build.tenant_id,
                workflow: job.workflow.clone(),
                job_name: job.name.clone(),
                digest,
            };
            if let Some(prior_id) = self.store.lookup_fingerprint(&key).await? {
                if prior_id != job.id {
                    let prior = self.store.get_job(prior_id).await;
                    let succeeded =
                        matches!(&prior, Ok(p) if p.status == JobStatus::Succeeded);
                    if succeeded
                        && verify_artifacts(&*self.store, &self.blobs, prior_id, None).await?
                    {
                        updated.indirect_to_job = Some(prior_id);
                        info!(job_id = %job.id, prior = %prior_id, "indirected job to prior run");
                    }
                }
            }
        }

        let stored = self.store.update_job(&updated, etag).await?;
        let build = if stored.indirect_to_job.is_some() {
            self.emit(
                NewQueueEvent::new(stored.build_id, QueueEventKind::JobStatusChanged, stored.id)
                    .with_name(stored.qualified_name())
                    .with_status("indirected"),
            )
            .await;
            self.roll_up_build(stored.build_id).await?
        } else {
            build
        };
        let cancel_requested = stored.cancel_requested || build.status == BuildStatus::Canceled;
        Ok(JobUpdate {
            job: stored,
            cancel_requested,
        })
    }

    /// Append jobs to a queued or running build. Deferred cross-workflow
    /// references held by existing jobs resolve against the new batch;
    /// insertion that would close a directed cycle anywhere in the graph
    /// is rejected.
    pub async fn create_jobs(
        &self,
        identity: Identity,
        build_id: ResourceId,
        defs: Vec<JobDef>,
    ) -> Result<Vec<Job>> {
        let build = self.store.get_build(build_id).await?;
        let existing = self.store.jobs_for_build(build_id).await?;
        self.authorize_dynamic_insertion(identity, &build, &existing)
            .await?;
        if build.status.is_terminal() {
            return Err(Error::FsmInvalid(format!(
                "build {} is {}",
                build.id,
                build.status.as_str()
            )));
        }
        let max = limits().max_jobs_per_build;
        if existing.len() + defs.len() > max {
            return Err(Error::LimitExceeded(format!(
                "build would have {} jobs, maximum is {max}",
                existing.len() + defs.len()
            )));
        }

        // Assign ids to the new batch so intra-batch references resolve.
        let mut batch_ids: HashMap<(String, String), ResourceId> = HashMap::new();
        let mut parsed: Vec<(String, JobDef)> = Vec::new();
        for def in defs {
            let (workflow, name) = parse_job_name(&def.name).map_err(Error::from)?;
            let workflow = workflow.unwrap_or_default();
            let qualified = (workflow.clone(), name.clone());
            if batch_ids.contains_key(&qualified)
                || existing
                    .iter()
                    .any(|j| j.workflow == workflow && j.name == name)
            {
                return Err(Error::AlreadyExists(format!("job {workflow}.{name}")));
            }
            batch_ids.insert(qualified, ResourceId::new());
            let mut def = def;
            def.name = name;
            parsed.push((workflow, def));
        }

        let existing_ids: HashMap<(String, String), ResourceId> = existing
            .iter()
            .map(|j| ((j.workflow.clone(), j.name.clone()), j.id))
            .collect();

        let mut new_jobs: Vec<Job> = Vec::new();
        let mut new_steps: Vec<Step> = Vec::new();
        for (workflow, def) in &parsed {
            let id = batch_ids[&(workflow.clone(), def.name.clone())];
            let mut depends = Vec::new();
            for dep in &def.depends {
                let target_workflow = dep.workflow.clone().unwrap_or_else(|| workflow.clone());
                let target = (target_workflow.clone(), dep.job.clone());
                let job_id = batch_ids
                    .get(&target)
                    .or_else(|| existing_ids.get(&target))
                    .copied();
                if job_id.is_none() && target_workflow == *workflow {
                    return Err(Error::ValidationFailed(format!(
                        "job {} depends on unknown job {} in the same workflow",
                        def.name, dep.job
                    )));
                }
                depends.push(JobDependency {
                    workflow: target_workflow,
                    job_name: dep.job.clone(),
                    artifacts: dep.artifacts.clone(),
                    job_id,
                });
            }
            let (job, steps) = build_job(&build, workflow, def, id, depends)?;
            new_jobs.push(job);
            new_steps.extend(steps);
        }

        // Resolve deferred references on existing jobs that now point at
        // members of this batch.
        let mut resolved_existing: Vec<Job> = Vec::new();
        for job in &existing {
            let mut changed = false;
            let mut patched = job.clone();
            for dep in &mut patched.depends {
                if dep.job_id.is_none() {
                    let target = (dep.workflow.clone(), dep.job_name.clone());
                    if let Some(id) = batch_ids.get(&target) {
                        dep.job_id = Some(*id);
                        changed = true;
                    }
                }
            }
            if changed {
                resolved_existing.push(patched);
            }
        }

        // Whole-graph cycle walk over resolved edges.
        let mut graph: Vec<Job> = existing
            .iter()
            .map(|j| {
                resolved_existing
                    .iter()
                    .find(|r| r.id == j.id)
                    .cloned()
                    .unwrap_or_else(|| j.clone())
            })
            .collect();
        graph.extend(new_jobs.iter().cloned());
        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::Cycle(format!("dependency cycle through {cycle}")));
        }

        self.store.insert_jobs(&new_jobs, &new_steps).await?;
        for job in &resolved_existing {
            self.cas_update_job(job.clone()).await?;
        }

        let root = self
            .store
            .descriptor_for_subject(build_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("log descriptor for build {build_id}")))?;
        for job in &new_jobs {
            self.store.record_owner(job.id, identity).await?;
            let job_log = LogDescriptor::new(job.id, Some(root.id));
            self.store.insert_descriptor(&job_log).await?;
            for step in new_steps.iter().filter(|s| s.job_id == job.id) {
                self.store
                    .insert_descriptor(&LogDescriptor::new(step.id, Some(job_log.id)))
                    .await?;
            }
            self.emit(
                NewQueueEvent::new(build_id, QueueEventKind::JobAdded, job.id)
                    .with_name(job.qualified_name()),
            )
            .await;
        }
        info!(build_id = %build_id, appended = new_jobs.len(), "appended dynamic jobs");
        Ok(new_jobs)
    }

    /// The full graph of a build.
    pub async fn read_queued_build(
        &self,
        identity: Identity,
        build_id: ResourceId,
    ) -> Result<BuildGraph> {
        self.authorize(identity, Operation::Read, build_id).await?;
        let build = self.store.get_build(build_id).await?;
        let jobs = self.store.jobs_for_build(build_id).await?;
        let mut steps = Vec::new();
        for job in &jobs {
            steps.extend(self.store.steps_for_job(job.id).await?);
        }
        Ok(assemble_graph(build, jobs, steps))
    }

    /// User-initiated cancellation. Unleased jobs cancel immediately;
    /// leased jobs are flagged and their runners learn from the next
    /// status-update response.
    pub async fn cancel_build(&self, identity: Identity, build_id: ResourceId) -> Result<Build> {
        self.authorize(identity, Operation::Update, build_id).await?;
        let build = self.store.get_build(build_id).await?;
        if build.status.is_terminal() {
            return Ok(build);
        }

        let now = Utc::now();
        for job in self.store.jobs_for_build(build_id).await? {
            if job.status.is_terminal() {
                continue;
            }
            let mut updated = job.clone();
            if job.lease.is_some() {
                updated.cancel_requested = true;
            } else {
                updated.status = JobStatus::Canceled;
                updated.finished_at = Some(now);
            }
            let stored = self.cas_update_job(updated).await?;
            if stored.status == JobStatus::Canceled {
                for step in self.store.steps_for_job(stored.id).await? {
                    if step.status.can_transition_to(StepStatus::Canceled) {
                        let mut canceled = step.clone();
                        canceled.status = StepStatus::Canceled;
                        canceled.finished_at = Some(now);
                        self.store.update_step(&canceled, step.etag).await?;
                    }
                }
                self.emit(
                    NewQueueEvent::new(build_id, QueueEventKind::JobStatusChanged, stored.id)
                        .with_name(stored.qualified_name())
                        .with_status(stored.status.as_str()),
                )
                .await;
            }
        }

        let mut canceled = self.store.get_build(build_id).await?;
        canceled.status = BuildStatus::Canceled;
        canceled.canceled_at = Some(now);
        canceled.finished_at = Some(now);
        let etag = canceled.etag;
        let stored = self.store.update_build(&canceled, etag).await?;
        info!(build_id = %build_id, "canceled build");
        Ok(stored)
    }

    /// Register an artifact a runner produced for its leased job. The
    /// uploaded blob is checked against the claimed size and digest.
    pub async fn register_artifact(
        &self,
        identity: Identity,
        job_id: ResourceId,
        group: &str,
        path: &str,
        size: u64,
        digest: Digest,
    ) -> Result<Artifact> {
        let job = self.store.get_job(job_id).await?;
        let leased_to_caller = job
            .lease
            .as_ref()
            .is_some_and(|l| l.runner_id == identity.0);
        if !leased_to_caller {
            return Err(Error::Unauthorized);
        }
        if job.status.is_terminal() {
            return Err(Error::FsmInvalid(format!(
                "job {} is already {}",
                job.id,
                job.status.as_str()
            )));
        }

        let key = artifact_blob_key(&job_id, group, path);
        let Some(bytes) = self.blobs.get(&key).await? else {
            return Err(Error::ValidationFailed(format!(
                "artifact blob {key} has not been uploaded"
            )));
        };
        if bytes.len() as u64 != size {
            return Err(Error::ValidationFailed(format!(
                "artifact {key} is {} bytes, claimed {size}",
                bytes.len()
            )));
        }
        if !digest_matches(&digest, &bytes) {
            return Err(Error::ValidationFailed(format!(
                "artifact {key} content does not match its digest"
            )));
        }

        let artifact = Artifact::new(job_id, group, path, size, digest);
        self.store.insert_artifact(&artifact).await?;
        Ok(artifact)
    }

    /// Search builds visible to the identity.
    pub async fn search_builds(
        &self,
        identity: Identity,
        tenant_id: ResourceId,
        query: &Query,
        page: &Page,
    ) -> Result<Vec<Build>> {
        let filter = self.access_filter(identity, Operation::Read).await?;
        Ok(self
            .store
            .list_builds(tenant_id, &filter, query, page)
            .await?)
    }

    /// Authorization probe.
    pub async fn ping(&self, identity: Identity) -> Result<()> {
        if let Some(session) = self.sessions.session(identity.0) {
            let runner = self.store.get_runner(session.runner_id).await?;
            if !runner.enabled {
                return Err(Error::AccountDisabled(runner.name));
            }
            return Ok(());
        }
        let owned = self.store.resources_owned_by(identity).await?;
        if owned.is_empty() {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    /// Subscribe to a build's event stream.
    pub async fn subscribe(
        &self,
        identity: Identity,
        build_id: ResourceId,
        from_seq: u64,
    ) -> Result<crate::events::EventSubscription> {
        self.authorize(identity, Operation::Read, build_id).await?;
        Ok(self.events.subscribe(build_id, from_seq))
    }

    // ----- internals -------------------------------------------------

    async fn emit(&self, event: NewQueueEvent) {
        // Event delivery is best-effort on top of the committed state
        // change; a failed append must not fail the transition.
        if let Err(err) = self.events.publish(event).await {
            warn!(%err, "failed to publish queue event");
        }
    }

    async fn authorize(
        &self,
        identity: Identity,
        operation: Operation,
        resource: ResourceId,
    ) -> Result<()> {
        let groups = self.store.groups_for_identity(identity).await?;
        let grants = self.store.grants_for_identity(identity, &groups).await?;
        let owner = self.store.owner_of(resource).await?;
        if access::evaluate(identity, &groups, &grants, operation, resource, owner) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    async fn access_filter(
        &self,
        identity: Identity,
        operation: Operation,
    ) -> Result<AccessFilter> {
        let groups = self.store.groups_for_identity(identity).await?;
        let grants = self.store.grants_for_identity(identity, &groups).await?;
        let mut ids = access::granted_resources(identity, &groups, &grants, operation);
        ids.extend(self.store.resources_owned_by(identity).await?);
        Ok(AccessFilter::Ids(ids))
    }

    /// A leased job may only be mutated by its leasing runner; an unleased
    /// job requires an update grant on the enclosing build.
    async fn authorize_job_mutation(&self, identity: Identity, job: &Job) -> Result<()> {
        match &job.lease {
            Some(lease) if lease.runner_id == identity.0 => Ok(()),
            Some(_) => Err(Error::Unauthorized),
            None => self.authorize(identity, Operation::Update, job.build_id).await,
        }
    }

    /// Dynamic insertion is open to the build's runners (a jobinator is a
    /// leased job) and to identities holding an update grant.
    async fn authorize_dynamic_insertion(
        &self,
        identity: Identity,
        build: &Build,
        jobs: &[Job],
    ) -> Result<()> {
        let is_leasing_runner = jobs.iter().any(|j| {
            !j.status.is_terminal()
                && j.lease.as_ref().is_some_and(|l| l.runner_id == identity.0)
        });
        if is_leasing_runner {
            return Ok(());
        }
        self.authorize(identity, Operation::Update, build.id).await
    }

    /// Whether every dependency of `job` permits dequeue: resolved, target
    /// effectively succeeded, and artifacts (for artifact dependencies)
    /// verified.
    async fn dependencies_satisfied(&self, job: &Job) -> Result<bool> {
        for dep in &job.depends {
            let Some(target_id) = dep.job_id else {
                // Deferred references block dequeue, never admission.
                return Ok(false);
            };
            let target = self.store.get_job(target_id).await?;
            let Some(effective_id) = self.effective_success(&target).await? else {
                return Ok(false);
            };
            if dep.artifacts.is_some()
                && !verify_artifacts(&*self.store, &self.blobs, effective_id, dep.artifacts.as_ref())
                    .await?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The id whose outputs satisfy dependents of `job`: the job itself
    /// when it succeeded, or its indirection target when that target
    /// succeeded.
    async fn effective_success(&self, job: &Job) -> Result<Option<ResourceId>> {
        if job.status == JobStatus::Succeeded {
            return Ok(Some(job.id));
        }
        if let Some(target_id) = job.indirect_to_job {
            let target = self.store.get_job(target_id).await?;
            if target.status == JobStatus::Succeeded {
                return Ok(Some(target.id));
            }
        }
        Ok(None)
    }

    /// Grow the build's current workflow list: whenever an eligible job
    /// depends on a workflow outside the list, that workflow joins it.
    /// Runs to a fixpoint and persists any growth.
    async fn grow_workflow_list(&self, build: &mut Build) -> Result<()> {
        let jobs = self.store.jobs_for_build(build.id).await?;
        let mut changed = false;
        loop {
            let mut grew = false;
            for job in &jobs {
                if !build.workflow_eligible(&job.workflow) {
                    continue;
                }
                for dep in &job.depends {
                    let target_workflow = if dep.workflow.is_empty() {
                        job.workflow.clone()
                    } else {
                        dep.workflow.clone()
                    };
                    if build.admit_workflow(&target_workflow) {
                        debug!(build_id = %build.id, workflow = %target_workflow, "workflow joined current list");
                        grew = true;
                        changed = true;
                    }
                }
            }
            if !grew {
                break;
            }
        }
        if changed {
            *build = self.cas_update_build(build.clone()).await?;
        }
        Ok(())
    }

    /// Recompute the build status from its jobs, retrying the write while
    /// concurrent transitions bump the etag.
    async fn roll_up_build(&self, build_id: ResourceId) -> Result<Build> {
        for _ in 0..CAS_RETRIES {
            let build = self.store.get_build(build_id).await?;
            if build.status.is_terminal() {
                return Ok(build);
            }
            let jobs = self.store.jobs_for_build(build_id).await?;

            let mut any_failed = false;
            let mut any_canceled = false;
            let mut any_started = false;
            let mut all_settled = true;
            for job in &jobs {
                if self.effective_success(job).await?.is_some() {
                    continue;
                }
                match job.status {
                    JobStatus::Failed => any_failed = true,
                    JobStatus::Canceled => any_canceled = true,
                    JobStatus::Running => {
                        any_started = true;
                        all_settled = false;
                    }
                    JobStatus::Queued | JobStatus::Submitted => all_settled = false,
                    JobStatus::Succeeded => {}
                }
            }

            let next = if all_settled && !jobs.is_empty() {
                if any_failed {
                    BuildStatus::Failed
                } else if any_canceled {
                    BuildStatus::Canceled
                } else {
                    BuildStatus::Succeeded
                }
            } else if any_started || build.status == BuildStatus::Running {
                BuildStatus::Running
            } else {
                build.status
            };

            if next == build.status {
                return Ok(build);
            }
            let now = Utc::now();
            let mut updated = build.clone();
            updated.status = next;
            if next == BuildStatus::Running && updated.running_at.is_none() {
                updated.running_at = Some(now);
            }
            if next.is_terminal() {
                updated.finished_at = Some(now);
            }
            if next == BuildStatus::Canceled {
                updated.canceled_at = Some(now);
            }
            let etag = updated.etag;
            match self.store.update_build(&updated, etag).await {
                Ok(stored) => {
                    info!(build_id = %build_id, status = next.as_str(), "build rolled up");
                    return Ok(stored);
                }
                Err(conveyor_db::DbError::Stale(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::OptimisticLock(format!("build {build_id}")))
    }

    /// Engine-internal job update: compare-and-swap with refetch on stale,
    /// re-applying the mutation to the fresh row.
    async fn cas_update_job(&self, job: Job) -> Result<Job> {
        let mut attempt = job;
        for _ in 0..CAS_RETRIES {
            let etag = attempt.etag;
            match self.store.update_job(&attempt, etag).await {
                Ok(stored) => return Ok(stored),
                Err(conveyor_db::DbError::Stale(_)) => {
                    let fresh = self.store.get_job(attempt.id).await?;
                    let mut merged = attempt.clone();
                    merged.etag = fresh.etag;
                    // Keep the fresh row's status machine state; only the
                    // fields this engine pass set are carried over.
                    merged.status = if attempt.status == JobStatus::Canceled {
                        if fresh.status.can_transition_to(JobStatus::Canceled)
                            || fresh.status == JobStatus::Canceled
                        {
                            JobStatus::Canceled
                        } else {
                            fresh.status
                        }
                    } else {
                        fresh.status
                    };
                    attempt = merged;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::OptimisticLock(format!("job {}", attempt.id)))
    }

    async fn cas_update_build(&self, build: Build) -> Result<Build> {
        let mut attempt = build;
        for _ in 0..CAS_RETRIES {
            let etag = attempt.etag;
            match self.store.update_build(&attempt, etag).await {
                Ok(stored) => return Ok(stored),
                Err(conveyor_db::DbError::Stale(_)) => {
                    let fresh = self.store.get_build(attempt.id).await?;
                    let mut merged = fresh.clone();
                    // Re-apply workflow growth onto the fresh row.
                    for workflow in &attempt.workflow_list {
                        merged.admit_workflow(workflow);
                    }
                    attempt = merged;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::OptimisticLock(format!("build {}", attempt.id)))
    }
}

/// Turn a parsed definition into persistable jobs and steps, resolving
/// references against the build itself. Dangling same-workflow references
/// fail; cross-workflow references to absent workflows stay deferred.
fn materialize(definition: &BuildDefinition, build: &Build) -> Result<(Vec<Job>, Vec<Step>)> {
    let mut ids: HashMap<(String, String), ResourceId> = HashMap::new();
    for workflow in &definition.workflows {
        for def in &workflow.jobs {
            ids.insert((workflow.name.clone(), def.name.clone()), ResourceId::new());
        }
    }

    let mut jobs = Vec::new();
    let mut steps = Vec::new();
    for workflow in &definition.workflows {
        for def in &workflow.jobs {
            let id = ids[&(workflow.name.clone(), def.name.clone())];
            let mut depends = Vec::new();
            for dep in &def.depends {
                let target_workflow =
                    dep.workflow.clone().unwrap_or_else(|| workflow.name.clone());
                let resolved = ids
                    .get(&(target_workflow.clone(), dep.job.clone()))
                    .copied();
                if resolved.is_none() && target_workflow == workflow.name {
                    return Err(Error::ValidationFailed(format!(
                        "job {} depends on unknown job {} in the same workflow",
                        def.name, dep.job
                    )));
                }
                depends.push(JobDependency {
                    workflow: target_workflow,
                    job_name: dep.job.clone(),
                    artifacts: dep.artifacts.clone(),
                    job_id: resolved,
                });
            }
            let (job, job_steps) = build_job(build, &workflow.name, def, id, depends)?;
            jobs.push(job);
            steps.extend(job_steps);
        }
    }
    Ok((jobs, steps))
}

/// Construct one job row (and its steps) from a definition.
fn build_job(
    build: &Build,
    workflow: &str,
    def: &JobDef,
    id: ResourceId,
    depends: Vec<JobDependency>,
) -> Result<(Job, Vec<Step>)> {
    let max_steps = limits().max_steps_per_job;
    if def.steps.len() > max_steps {
        return Err(Error::LimitExceeded(format!(
            "job {} has {} steps, maximum is {max_steps}",
            def.name,
            def.steps.len()
        )));
    }
    let mut names = HashSet::new();
    for step in &def.steps {
        if !names.insert(step.name.as_str()) {
            return Err(Error::ValidationFailed(format!(
                "duplicate step {} in job {}",
                step.name, def.name
            )));
        }
    }
    for step in &def.steps {
        for dep in &step.depends {
            if !names.contains(dep.as_str()) {
                return Err(Error::ValidationFailed(format!(
                    "step {} depends on unknown step {}",
                    step.name, dep
                )));
            }
        }
    }

    let now = Utc::now();
    let job = Job {
        id,
        build_id: build.id,
        workflow: workflow.to_string(),
        name: def.name.clone(),
        job_type: def.job_type,
        runtime: RuntimeSpec {
            image: def.image.clone(),
            env: def.env.clone(),
        },
        step_execution: def.step_execution,
        depends,
        fingerprint: None,
        indirect_to_job: None,
        status: JobStatus::Queued,
        error: None,
        lease: None,
        cancel_requested: false,
        created_at: now,
        started_at: None,
        finished_at: None,
        etag: 1,
    };
    let steps = def
        .steps
        .iter()
        .map(|s| Step {
            id: ResourceId::new(),
            job_id: id,
            name: s.name.clone(),
            commands: s.commands.clone(),
            depends: s.depends.clone(),
            status: StepStatus::Queued,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            etag: 1,
        })
        .collect();
    Ok((job, steps))
}

/// Find a directed cycle over resolved dependency edges. Returns the
/// qualified name of a job on the cycle.
fn find_cycle(jobs: &[Job]) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let index: HashMap<ResourceId, usize> = jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.id, i))
        .collect();
    let mut marks = vec![Mark::Unvisited; jobs.len()];

    for start in 0..jobs.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS; the stack holds (node, next edge offset).
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        marks[start] = Mark::InProgress;
        while let Some(&(node, edge)) = stack.last() {
            let deps = &jobs[node].depends;
            if edge >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            stack.last_mut().expect("non-empty stack").1 += 1;
            let Some(target_id) = deps[edge].job_id else {
                continue;
            };
            let Some(&target) = index.get(&target_id) else {
                // Edge into another build (an indirection source); not
                // part of this graph.
                continue;
            };
            match marks[target] {
                Mark::InProgress => return Some(jobs[target].qualified_name()),
                Mark::Unvisited => {
                    marks[target] = Mark::InProgress;
                    stack.push((target, 0));
                }
                Mark::Done => {}
            }
        }
    }
    None
}

fn assemble_graph(build: Build, jobs: Vec<Job>, steps: Vec<Step>) -> BuildGraph {
    let mut by_job: HashMap<ResourceId, Vec<Step>> = HashMap::new();
    for step in steps {
        by_job.entry(step.job_id).or_default().push(step);
    }
    let jobs = jobs
        .into_iter()
        .map(|job| {
            let steps = by_job.remove(&job.id).unwrap_or_default();
            JobGraph { job, steps }
        })
        .collect();
    BuildGraph { build, jobs }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_deps(name: &str, deps: Vec<(ResourceId, &str)>) -> Job {
        let build = Build::new(
            ResourceId::new(),
            ResourceId::new(),
            "sha",
            "main",
            BuildOptions::default(),
        );
        let (mut job, _) = build_job(
            &build,
            "",
            &JobDef {
                name: name.to_string(),
                job_type: conveyor_core::job::JobType::Exec,
                image: None,
                env: HashMap::new(),
                step_execution: Default::default(),
                depends: vec![],
                steps: vec![],
            },
            ResourceId::new(),
            vec![],
        )
        .unwrap();
        job.depends = deps
            .into_iter()
            .map(|(id, dep_name)| JobDependency {
                workflow: String::new(),
                job_name: dep_name.to_string(),
                artifacts: None,
                job_id: Some(id),
            })
            .collect();
        job
    }

    #[test]
    fn cycle_detection_finds_loops() {
        let a = job_with_deps("a", vec![]);
        let b = job_with_deps("b", vec![(a.id, "a")]);
        let mut a_cyclic = a.clone();
        a_cyclic.depends = vec![JobDependency {
            workflow: String::new(),
            job_name: "b".to_string(),
            artifacts: None,
            job_id: Some(b.id),
        }];
        assert!(find_cycle(&[a_cyclic, b]).is_some());
    }

    #[test]
    fn acyclic_graph_passes() {
        let a = job_with_deps("a", vec![]);
        let b = job_with_deps("b", vec![(a.id, "a")]);
        let c = job_with_deps("c", vec![(a.id, "a"), (b.id, "b")]);
        assert!(find_cycle(&[a, b, c]).is_none());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut a = job_with_deps("a", vec![]);
        a.depends = vec![JobDependency {
            workflow: String::new(),
            job_name: "a".to_string(),
            artifacts: None,
            job_id: Some(a.id),
        }];
        assert!(find_cycle(&[a]).is_some());
    }

    #[test]
    fn deferred_edges_do_not_count()  {
        let mut a = job_with_deps("a", vec![]);
        a.depends = vec![JobDependency {
            workflow: "later".to_string(),
            job_name: "ghost".to_string(),
            artifacts: None,
            job_id: None,
        }];
        assert!(find_cycle(&[a]).is_none());
    }
}
