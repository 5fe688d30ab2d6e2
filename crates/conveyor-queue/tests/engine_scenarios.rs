//! End-to-end queue engine scenarios over the in-memory backend: simple
//! builds, fingerprint indirection, dynamic insertion, workflow subsets,
//! and the concurrency guarantees around leases and etags.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

use conveyor_config::{ConfigFormat, DependencyRef, JobDef, StepDef};
use conveyor_core::access::Identity;
use conveyor_core::build::BuildOptions;
use conveyor_core::event::QueueEventKind;
use conveyor_core::job::{JobType, StepExecution};
use conveyor_core::query::{Page, Query};
use conveyor_core::status::{BuildStatus, JobStatus};
use conveyor_core::store::BlobStore;
use conveyor_core::{Error, ResourceId};
use conveyor_db::{BuildRepo, JobRepo, MemoryBlobStore, MemoryStore};
use conveyor_queue::engine::JobUpdate;
use conveyor_queue::fingerprint::sha256_digest;
use conveyor_queue::{EnqueueRequest, EventBroker, QueueEngine, RunnerRegistry};

struct Harness {
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    broker: Arc<EventBroker>,
    engine: QueueEngine,
    registry: Arc<RunnerRegistry>,
    tenant: ResourceId,
    user: Identity,
    runner: Identity,
}

async fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let broker = Arc::new(EventBroker::new(store.clone()));
    let registry = Arc::new(RunnerRegistry::new(store.clone()));
    let engine = QueueEngine::new(store.clone(), blobs.clone(), broker.clone(), registry.clone());

    let tenant = ResourceId::new();
    let runner = registry
        .register(
            tenant,
            "worker-1",
            "key-1",
            conveyor_core::runner::Capabilities {
                os: "linux".into(),
                arch: "amd64".into(),
                job_types: vec![JobType::Docker, JobType::Exec, JobType::Dynamic],
                labels: vec![],
            },
        )
        .await
        .unwrap();
    registry.connect("key-1").await.unwrap();

    Harness {
        store,
        blobs,
        broker,
        engine,
        registry,
        tenant,
        user: Identity(ResourceId::new()),
        runner: Identity(runner.id),
    }
}

fn request(h: &Harness, config: &str, opts: BuildOptions) -> EnqueueRequest {
    EnqueueRequest {
        tenant_id: h.tenant,
        repo_id: ResourceId::new(),
        commit_sha: "0123456789abcdef0123456789abcdef01234567".into(),
        ref_name: "main".into(),
        opts,
        config: config.as_bytes().to_vec(),
        format: ConfigFormat::Kdl,
        env: HashMap::new(),
    }
}

async fn run_to_success(h: &Harness, job_id: ResourceId, etag: i64) -> JobUpdate {
    let running = h
        .engine
        .update_job_status(h.runner, job_id, JobStatus::Running, None, etag)
        .await
        .unwrap();
    h.engine
        .update_job_status(h.runner, job_id, JobStatus::Succeeded, None, running.job.etag)
        .await
        .unwrap()
}

const TWO_JOB_CONFIG: &str = r#"
version 1
job "a" {
    type "exec"
    step "main" {
        run "make a"
    }
}
job "b" {
    type "exec"
    depends "a"
    step "main" {
        run "make b"
    }
}
"#;

#[tokio::test]
async fn simple_build_runs_to_success() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    assert_eq!(graph.build.status, BuildStatus::Queued);
    assert_eq!(graph.jobs.len(), 2);

    // Only `a` is runnable; `b` waits on it.
    let first = h.engine.dequeue(h.runner.0).await?.expect("a runnable");
    assert_eq!(first.job.name, "a");
    assert_eq!(first.job.status, JobStatus::Submitted);
    assert!(h.engine.dequeue(h.runner.0).await?.is_none());

    run_to_success(&h, first.job.id, first.job.etag).await;

    let second = h.engine.dequeue(h.runner.0).await?.expect("b runnable");
    assert_eq!(second.job.name, "b");
    run_to_success(&h, second.job.id, second.job.etag).await;

    let build = h.store.get_build(graph.build.id).await?;
    assert_eq!(build.status, BuildStatus::Succeeded);
    Ok(())
}

#[tokio::test]
async fn fingerprint_indirection_skips_execution() -> anyhow::Result<()> {
    let h = harness().await;
    let digest = sha256_digest(b"inputs of b");

    // First build: run everything, register b's artifact, fingerprint b.
    let first = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a1 = h.engine.dequeue(h.runner.0).await?.unwrap();
    run_to_success(&h, a1.job.id, a1.job.etag).await;
    let b1 = h.engine.dequeue(h.runner.0).await?.unwrap();
    assert_eq!(b1.job.name, "b");
    let running = h
        .engine
        .update_job_status(h.runner, b1.job.id, JobStatus::Running, None, b1.job.etag)
        .await?;

    let content = b"compiled output".to_vec();
    h.blobs
        .put(
            &conveyor_core::artifact::artifact_blob_key(&b1.job.id, "dist", "out.bin"),
            Bytes::from(content.clone()),
        )
        .await?;
    h.engine
        .register_artifact(
            h.runner,
            b1.job.id,
            "dist",
            "out.bin",
            content.len() as u64,
            sha256_digest(&content),
        )
        .await?;
    let fingerprinted = h
        .engine
        .update_job_fingerprint(h.runner, b1.job.id, digest.clone(), running.job.etag)
        .await?;
    h.engine
        .update_job_status(
            h.runner,
            b1.job.id,
            JobStatus::Succeeded,
            None,
            fingerprinted.job.etag,
        )
        .await?;
    assert_eq!(
        h.store.get_build(first.build.id).await?.status,
        BuildStatus::Succeeded
    );

    // Second build: same fingerprint, so b indirects and never runs.
    let second = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a2 = h.engine.dequeue(h.runner.0).await?.unwrap();
    run_to_success(&h, a2.job.id, a2.job.etag).await;

    let b2 = second
        .jobs
        .iter()
        .find(|j| j.job.name == "b")
        .unwrap()
        .job
        .clone();
    let updated = h
        .engine
        .update_job_fingerprint(h.user, b2.id, digest.clone(), b2.etag)
        .await?;
    assert_eq!(updated.job.indirect_to_job, Some(b1.job.id));

    assert!(h.engine.dequeue(h.runner.0).await?.is_none());
    assert_eq!(
        h.store.get_build(second.build.id).await?.status,
        BuildStatus::Succeeded
    );

    // Third build: the prior artifact is gone, so verification clears the
    // indirection and b runs for real.
    h.blobs
        .delete(&conveyor_core::artifact::artifact_blob_key(
            &b1.job.id,
            "dist",
            "out.bin",
        ))
        .await?;
    let third = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a3 = h.engine.dequeue(h.runner.0).await?.unwrap();
    run_to_success(&h, a3.job.id, a3.job.etag).await;
    let b3 = third
        .jobs
        .iter()
        .find(|j| j.job.name == "b")
        .unwrap()
        .job
        .clone();
    let updated = h
        .engine
        .update_job_fingerprint(h.user, b3.id, digest, b3.etag)
        .await?;
    assert_eq!(updated.job.indirect_to_job, None);
    let b3_run = h.engine.dequeue(h.runner.0).await?.expect("b runs again");
    assert_eq!(b3_run.job.name, "b");
    Ok(())
}

#[tokio::test]
async fn forced_build_ignores_fingerprint_matches() -> anyhow::Result<()> {
    let h = harness().await;
    let digest = sha256_digest(b"inputs");

    let first = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a1 = h.engine.dequeue(h.runner.0).await?.unwrap();
    run_to_success(&h, a1.job.id, a1.job.etag).await;
    let b1 = h.engine.dequeue(h.runner.0).await?.unwrap();
    let running = h
        .engine
        .update_job_status(h.runner, b1.job.id, JobStatus::Running, None, b1.job.etag)
        .await?;
    let fp = h
        .engine
        .update_job_fingerprint(h.runner, b1.job.id, digest.clone(), running.job.etag)
        .await?;
    h.engine
        .update_job_status(h.runner, b1.job.id, JobStatus::Succeeded, None, fp.job.etag)
        .await?;
    let _ = first;

    let forced = h
        .engine
        .enqueue_build(
            h.user,
            request(
                &h,
                TWO_JOB_CONFIG,
                BuildOptions {
                    force: true,
                    workflows: vec![],
                },
            ),
        )
        .await?;
    let b2 = forced
        .jobs
        .iter()
        .find(|j| j.job.name == "b")
        .unwrap()
        .job
        .clone();
    let updated = h
        .engine
        .update_job_fingerprint(h.user, b2.id, digest, b2.etag)
        .await?;
    assert_eq!(updated.job.indirect_to_job, None);
    Ok(())
}

const ORCHESTRATOR_CONFIG: &str = r#"
version 1
workflow "orchestrator" {
    job "x" {
        type "dynamic"
        step "drive" {
            run "submit-jobs"
        }
    }
}
"#;

#[tokio::test]
async fn dynamic_insertion_resolves_cross_workflow_batch() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, ORCHESTRATOR_CONFIG, BuildOptions::default()))
        .await?;

    let x = h.engine.dequeue(h.runner.0).await?.expect("x runnable");
    assert_eq!(x.job.name, "x");
    let x_running = h
        .engine
        .update_job_status(h.runner, x.job.id, JobStatus::Running, None, x.job.etag)
        .await?;

    // The running jobinator submits y and z; z's reference to build.y
    // resolves inside the batch.
    let step = |cmd: &str| StepDef {
        name: "main".into(),
        commands: vec![cmd.into()],
        depends: vec![],
    };
    let appended = h
        .engine
        .create_jobs(
            h.runner,
            graph.build.id,
            vec![
                JobDef {
                    name: "build.y".into(),
                    job_type: JobType::Exec,
                    image: None,
                    env: HashMap::new(),
                    step_execution: StepExecution::Parallel,
                    depends: vec![],
                    steps: vec![step("make y")],
                },
                JobDef {
                    name: "test.z".into(),
                    job_type: JobType::Exec,
                    image: None,
                    env: HashMap::new(),
                    step_execution: StepExecution::Parallel,
                    depends: vec![DependencyRef {
                        workflow: Some("build".into()),
                        job: "y".into(),
                        artifacts: None,
                    }],
                    steps: vec![step("make z")],
                },
            ],
        )
        .await?;
    assert_eq!(appended.len(), 2);
    let z = appended.iter().find(|j| j.name == "z").unwrap();
    assert!(z.depends[0].job_id.is_some(), "batch reference resolved");

    let y = h.engine.dequeue(h.runner.0).await?.expect("y runnable");
    assert_eq!(y.job.name, "y");
    run_to_success(&h, y.job.id, y.job.etag).await;

    let z = h.engine.dequeue(h.runner.0).await?.expect("z runnable");
    assert_eq!(z.job.name, "z");
    run_to_success(&h, z.job.id, z.job.etag).await;

    h.engine
        .update_job_status(
            h.runner,
            x.job.id,
            JobStatus::Succeeded,
            None,
            x_running.job.etag,
        )
        .await?;
    assert_eq!(
        h.store.get_build(graph.build.id).await?.status,
        BuildStatus::Succeeded
    );
    Ok(())
}

#[tokio::test]
async fn dynamic_cycle_is_rejected() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, ORCHESTRATOR_CONFIG, BuildOptions::default()))
        .await?;
    let x = h.engine.dequeue(h.runner.0).await?.unwrap();
    h.engine
        .update_job_status(h.runner, x.job.id, JobStatus::Running, None, x.job.etag)
        .await?;

    let step = StepDef {
        name: "main".into(),
        commands: vec!["true".into()],
        depends: vec![],
    };
    let err = h
        .engine
        .create_jobs(
            h.runner,
            graph.build.id,
            vec![
                JobDef {
                    name: "build.p".into(),
                    job_type: JobType::Exec,
                    image: None,
                    env: HashMap::new(),
                    step_execution: StepExecution::Parallel,
                    depends: vec![DependencyRef {
                        workflow: Some("build".into()),
                        job: "q".into(),
                        artifacts: None,
                    }],
                    steps: vec![step.clone()],
                },
                JobDef {
                    name: "build.q".into(),
                    job_type: JobType::Exec,
                    image: None,
                    env: HashMap::new(),
                    step_execution: StepExecution::Parallel,
                    depends: vec![DependencyRef {
                        workflow: Some("build".into()),
                        job: "p".into(),
                        artifacts: None,
                    }],
                    steps: vec![step],
                },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cycle(_)));
    Ok(())
}

const SUBSET_CONFIG: &str = r#"
version 1
workflow "generate" {
    job "foo" {
        type "exec"
        step "main" {
            run "codegen"
        }
    }
}
workflow "tests" {
    job "unit" {
        type "exec"
        depends "generate.foo"
        step "main" {
            run "cargo test"
        }
    }
}
workflow "deploy" {
    job "ship" {
        type "exec"
        step "main" {
            run "deploy"
        }
    }
}
"#;

#[tokio::test]
async fn workflow_subset_grows_but_never_admits_unrelated() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(
            h.user,
            request(
                &h,
                SUBSET_CONFIG,
                BuildOptions {
                    force: false,
                    workflows: vec!["tests".into()],
                },
            ),
        )
        .await?;

    // generate.foo joins the current list because tests.unit depends on
    // it; it is the only job with satisfied dependencies.
    let foo = h.engine.dequeue(h.runner.0).await?.expect("foo runnable");
    assert_eq!(foo.job.qualified_name(), "generate.foo");
    run_to_success(&h, foo.job.id, foo.job.etag).await;

    let unit = h.engine.dequeue(h.runner.0).await?.expect("unit runnable");
    assert_eq!(unit.job.qualified_name(), "tests.unit");
    run_to_success(&h, unit.job.id, unit.job.etag).await;

    // deploy.ship stays undequeuable, so the build cannot finish.
    assert!(h.engine.dequeue(h.runner.0).await?.is_none());
    let build = h.store.get_build(graph.build.id).await?;
    assert!(build.workflow_list.iter().any(|w| w == "generate"));
    assert!(!build.workflow_list.iter().any(|w| w == "deploy"));
    assert_ne!(build.status, BuildStatus::Succeeded);
    Ok(())
}

#[tokio::test]
async fn lease_is_granted_to_exactly_one_runner() -> anyhow::Result<()> {
    let h = harness().await;
    let second = h
        .registry
        .register(
            h.tenant,
            "worker-2",
            "key-2",
            conveyor_core::runner::Capabilities {
                os: "linux".into(),
                arch: "amd64".into(),
                job_types: vec![JobType::Exec],
                labels: vec![],
            },
        )
        .await?;
    h.registry.connect("key-2").await?;

    h.engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;

    let first = h.engine.dequeue(h.runner.0).await?;
    let other = h.engine.dequeue(second.id).await?;
    assert!(first.is_some());
    assert!(other.is_none(), "job a was already leased");

    // The non-leasing runner may not transition the job.
    let job = first.unwrap().job;
    let err = h
        .engine
        .update_job_status(
            Identity(second.id),
            job.id,
            JobStatus::Running,
            None,
            job.etag,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    Ok(())
}

#[tokio::test]
async fn stale_etags_and_terminal_states_are_rejected() -> anyhow::Result<()> {
    let h = harness().await;
    h.engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a = h.engine.dequeue(h.runner.0).await?.unwrap();
    let stale_etag = a.job.etag;
    let done = run_to_success(&h, a.job.id, a.job.etag).await;

    // Stale etag.
    let err = h
        .engine
        .update_job_status(h.runner, a.job.id, JobStatus::Running, None, stale_etag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FsmInvalid(_) | Error::OptimisticLock(_)));

    // Terminal status never transitions again.
    let err = h
        .engine
        .update_job_status(
            h.runner,
            a.job.id,
            JobStatus::Canceled,
            None,
            done.job.etag,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FsmInvalid(_)));
    Ok(())
}

#[tokio::test]
async fn cancellation_propagates_through_update_responses() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let a = h.engine.dequeue(h.runner.0).await?.unwrap();
    let running = h
        .engine
        .update_job_status(h.runner, a.job.id, JobStatus::Running, None, a.job.etag)
        .await?;
    assert!(!running.cancel_requested);

    let build = h.engine.cancel_build(h.user, graph.build.id).await?;
    assert_eq!(build.status, BuildStatus::Canceled);

    // The unleased job b was canceled outright.
    let b = h
        .store
        .jobs_for_build(graph.build.id)
        .await?
        .into_iter()
        .find(|j| j.name == "b")
        .unwrap();
    assert_eq!(b.status, JobStatus::Canceled);

    // The leased job learns on its next report and abandons.
    let fresh = h.store.get_job(a.job.id).await?;
    let update = h
        .engine
        .update_job_status(
            h.runner,
            a.job.id,
            JobStatus::Canceled,
            None,
            fresh.etag,
        )
        .await?;
    assert!(update.cancel_requested);
    Ok(())
}

#[tokio::test]
async fn cycles_and_dangling_references_fail_admission() -> anyhow::Result<()> {
    let h = harness().await;

    let cyclic = r#"
version 1
job "a" {
    type "exec"
    depends "b"
    step "main" { run "true" }
}
job "b" {
    type "exec"
    depends "a"
    step "main" { run "true" }
}
"#;
    let err = h
        .engine
        .enqueue_build(h.user, request(&h, cyclic, BuildOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidationFailed(_)));

    let dangling = r#"
version 1
job "a" {
    type "exec"
    depends "ghost"
    step "main" { run "true" }
}
"#;
    let err = h
        .engine
        .enqueue_build(h.user, request(&h, dangling, BuildOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ValidationFailed(_)));
    Ok(())
}

#[tokio::test]
async fn events_follow_the_build() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;

    let mut sub = h.broker.subscribe(graph.build.id, 1);
    let first = sub.next().await?;
    assert_eq!(first.kind, QueueEventKind::JobAdded);
    let second = sub.next().await?;
    assert_eq!(second.kind, QueueEventKind::JobAdded);
    assert_eq!(second.seq, first.seq + 1);

    let a = h.engine.dequeue(h.runner.0).await?.unwrap();
    let event = sub.next().await?;
    assert_eq!(event.kind, QueueEventKind::JobStatusChanged);
    assert_eq!(event.status.as_deref(), Some("submitted"));
    assert_eq!(event.subject_id, a.job.id);
    Ok(())
}

#[tokio::test]
async fn searches_only_return_authorized_builds() -> anyhow::Result<()> {
    let h = harness().await;
    let other_user = Identity(ResourceId::new());

    let mine = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let theirs = h
        .engine
        .enqueue_build(other_user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;

    let results = h
        .engine
        .search_builds(h.user, h.tenant, &Query::default(), &Page::default())
        .await?;
    let ids: Vec<ResourceId> = results.iter().map(|b| b.id).collect();
    assert!(ids.contains(&mine.build.id));
    assert!(!ids.contains(&theirs.build.id));

    // Point reads are equally fenced.
    let err = h
        .engine
        .read_queued_build(h.user, theirs.build.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized));
    Ok(())
}

#[tokio::test]
async fn read_queued_build_returns_the_graph() -> anyhow::Result<()> {
    let h = harness().await;
    let graph = h
        .engine
        .enqueue_build(h.user, request(&h, TWO_JOB_CONFIG, BuildOptions::default()))
        .await?;
    let read = h.engine.read_queued_build(h.user, graph.build.id).await?;
    assert_eq!(read.jobs.len(), 2);
    assert!(read.jobs.iter().all(|j| j.steps.len() == 1));
    Ok(())
}

#[tokio::test]
async fn oversized_configs_are_rejected_up_front() -> anyhow::Result<()> {
    let h = harness().await;
    let too_big = conveyor_core::limits().max_config_bytes + 1;
    let err = h.engine.check_build_config_length(too_big).unwrap_err();
    assert!(matches!(err, Error::LimitExceeded(_)));
    Ok(())
}
