//! PostgreSQL backend.
//!
//! Entities are stored as jsonb documents next to the columns the queries
//! actually filter and sort on. The `etag` column is authoritative for
//! optimistic locking; the copy inside the document is overwritten from
//! the column on every read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use uuid::Uuid;

use conveyor_core::access::{AccessFilter, Grant, Identity, Subject};
use conveyor_core::artifact::Artifact;
use conveyor_core::build::Build;
use conveyor_core::event::{NewQueueEvent, QueueEvent, QueueEventKind};
use conveyor_core::job::{FingerprintKey, Job, Step};
use conveyor_core::log::LogDescriptor;
use conveyor_core::query::{CompareOp, Page, Query, SortDirection};
use conveyor_core::runner::Runner;
use conveyor_core::ResourceId;

use crate::repo::{
    ArtifactRepo, BuildRepo, EventRepo, FingerprintRepo, GrantRepo, JobRepo, LogRepo, RunnerRepo,
    StepRepo,
};
use crate::{DbError, DbResult};

/// All repository traits over one connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn encode<T: Serialize>(value: &T) -> DbResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> DbResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn map_unique(err: sqlx::Error, what: &str) -> DbError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return DbError::Duplicate(what.to_string());
        }
    }
    DbError::Database(err)
}

/// Interpret the outcome of a CAS `UPDATE ... RETURNING etag`: a missing
/// row is either `NotFound` or `Stale`, depending on whether the id
/// exists at all.
async fn cas_outcome(
    pool: &PgPool,
    table: &str,
    id: Uuid,
    what: String,
    returned: Option<i64>,
) -> DbResult<i64> {
    if let Some(etag) = returned {
        return Ok(etag);
    }
    let exists: bool =
        sqlx::query_scalar(&format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)"))
            .bind(id)
            .fetch_one(pool)
            .await?;
    if exists {
        Err(DbError::Stale(what))
    } else {
        Err(DbError::NotFound(what))
    }
}

#[async_trait]
impl BuildRepo for PgStore {
    async fn create_build(&self, build: &Build, jobs: &[Job], steps: &[Step]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO builds (id, tenant_id, status, created_at, data, etag)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.tenant_id.as_uuid())
        .bind(build.status.as_str())
        .bind(build.created_at)
        .bind(encode(build)?)
        .bind(build.etag)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique(e, "build"))?;

        for job in jobs {
            insert_job(&mut tx, job).await?;
        }
        for step in steps {
            insert_step(&mut tx, step).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let row = sqlx::query("SELECT data, etag FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        let mut build: Build = decode(row.get("data"))?;
        build.etag = row.get("etag");
        Ok(build)
    }

    async fn update_build(&self, build: &Build, expected_etag: i64) -> DbResult<Build> {
        let mut updated = build.clone();
        let returned: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE builds SET data = $2, status = $3, etag = etag + 1
            WHERE id = $1 AND ($4 = -1 OR etag = $4)
            RETURNING etag
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(encode(build)?)
        .bind(build.status.as_str())
        .bind(expected_etag)
        .fetch_optional(&self.pool)
        .await?;
        updated.etag = cas_outcome(
            &self.pool,
            "builds",
            *build.id.as_uuid(),
            format!("build {}", build.id),
            returned,
        )
        .await?;
        Ok(updated)
    }

    async fn list_builds(
        &self,
        tenant_id: ResourceId,
        filter: &AccessFilter,
        query: &Query,
        page: &Page,
    ) -> DbResult<Vec<Build>> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT data, etag FROM builds WHERE tenant_id = ",
        );
        builder.push_bind(tenant_id.as_uuid());

        if let AccessFilter::Ids(ids) = filter {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            builder.push(" AND id = ANY(").push_bind(ids).push(")");
        }
        for f in &query.filters {
            if f.field == "status" && f.op == CompareOp::Eq {
                builder.push(" AND status = ").push_bind(f.value.clone());
            }
        }
        if let Some(cursor) = &page.cursor {
            let boundary: DateTime<Utc> = cursor
                .boundary_value
                .parse()
                .map_err(|_| DbError::NotFound("cursor boundary".to_string()))?;
            let boundary_id: Uuid = cursor
                .boundary_id
                .parse()
                .map_err(|_| DbError::NotFound("cursor boundary".to_string()))?;
            let cmp = match cursor.direction {
                SortDirection::Asc => " AND (created_at, id) > (",
                SortDirection::Desc => " AND (created_at, id) < (",
            };
            builder
                .push(cmp)
                .push_bind(boundary)
                .push(", ")
                .push_bind(boundary_id)
                .push(")");
        }
        let direction = match query.effective_sort().direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        builder.push(format!(" ORDER BY created_at {direction}, id {direction} LIMIT "));
        builder.push_bind(page.effective_limit() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let mut build: Build = decode(row.get("data"))?;
                build.etag = row.get("etag");
                Ok(build)
            })
            .collect()
    }
}

async fn insert_job(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, job: &Job) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO jobs (id, build_id, workflow, name, status, created_at, data, etag)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.build_id.as_uuid())
    .bind(&job.workflow)
    .bind(&job.name)
    .bind(job.status.as_str())
    .bind(job.created_at)
    .bind(encode(job)?)
    .bind(job.etag)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_unique(e, "job"))?;
    Ok(())
}

async fn insert_step(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, step: &Step) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO steps (id, job_id, name, created_at, data, etag)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(step.id.as_uuid())
    .bind(step.job_id.as_uuid())
    .bind(&step.name)
    .bind(step.created_at)
    .bind(encode(step)?)
    .bind(step.etag)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_unique(e, "step"))?;
    Ok(())
}

#[async_trait]
impl JobRepo for PgStore {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        let row = sqlx::query("SELECT data, etag FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        let mut job: Job = decode(row.get("data"))?;
        job.etag = row.get("etag");
        Ok(job)
    }

    async fn insert_jobs(&self, jobs: &[Job], steps: &[Step]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            insert_job(&mut tx, job).await?;
        }
        for step in steps {
            insert_step(&mut tx, step).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_job(&self, job: &Job, expected_etag: i64) -> DbResult<Job> {
        let mut updated = job.clone();
        let returned: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET data = $2, status = $3, etag = etag + 1
            WHERE id = $1 AND ($4 = -1 OR etag = $4)
            RETURNING etag
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(encode(job)?)
        .bind(job.status.as_str())
        .bind(expected_etag)
        .fetch_optional(&self.pool)
        .await?;
        updated.etag = cas_outcome(
            &self.pool,
            "jobs",
            *job.id.as_uuid(),
            format!("job {}", job.id),
            returned,
        )
        .await?;
        Ok(updated)
    }

    async fn jobs_for_build(&self, build_id: ResourceId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT data, etag FROM jobs WHERE build_id = $1 ORDER BY created_at, id",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let mut job: Job = decode(row.get("data"))?;
                job.etag = row.get("etag");
                Ok(job)
            })
            .collect()
    }

    async fn queued_jobs(&self, tenant_id: ResourceId) -> DbResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT j.data, j.etag FROM jobs j
            JOIN builds b ON b.id = j.build_id
            WHERE b.tenant_id = $1
              AND j.status = 'queued'
              AND b.status IN ('queued', 'running')
              AND (j.data ->> 'indirect_to_job') IS NULL
            ORDER BY j.created_at, j.id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let mut job: Job = decode(row.get("data"))?;
                job.etag = row.get("etag");
                Ok(job)
            })
            .collect()
    }
}

#[async_trait]
impl StepRepo for PgStore {
    async fn get_step(&self, id: ResourceId) -> DbResult<Step> {
        let row = sqlx::query("SELECT data, etag FROM steps WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("step {id}")))?;
        let mut step: Step = decode(row.get("data"))?;
        step.etag = row.get("etag");
        Ok(step)
    }

    async fn update_step(&self, step: &Step, expected_etag: i64) -> DbResult<Step> {
        let mut updated = step.clone();
        let returned: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE steps SET data = $2, etag = etag + 1
            WHERE id = $1 AND ($3 = -1 OR etag = $3)
            RETURNING etag
            "#,
        )
        .bind(step.id.as_uuid())
        .bind(encode(step)?)
        .bind(expected_etag)
        .fetch_optional(&self.pool)
        .await?;
        updated.etag = cas_outcome(
            &self.pool,
            "steps",
            *step.id.as_uuid(),
            format!("step {}", step.id),
            returned,
        )
        .await?;
        Ok(updated)
    }

    async fn steps_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Step>> {
        let rows =
            sqlx::query("SELECT data, etag FROM steps WHERE job_id = $1 ORDER BY created_at, id")
                .bind(job_id.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                let mut step: Step = decode(row.get("data"))?;
                step.etag = row.get("etag");
                Ok(step)
            })
            .collect()
    }
}

#[async_trait]
impl ArtifactRepo for PgStore {
    async fn insert_artifact(&self, artifact: &Artifact) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, job_id, group_name, path, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(artifact.id.as_uuid())
        .bind(artifact.job_id.as_uuid())
        .bind(&artifact.group)
        .bind(&artifact.path)
        .bind(encode(artifact)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "artifact"))?;
        Ok(())
    }

    async fn artifacts_for_job(&self, job_id: ResourceId) -> DbResult<Vec<Artifact>> {
        let rows = sqlx::query(
            "SELECT data FROM artifacts WHERE job_id = $1 ORDER BY group_name, path",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| decode(row.get("data"))).collect()
    }
}

#[async_trait]
impl FingerprintRepo for PgStore {
    async fn upsert_fingerprint(&self, key: &FingerprintKey, job_id: ResourceId) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fingerprints (tenant_id, workflow, job_name, algorithm, value, job_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, workflow, job_name, algorithm, value)
            DO UPDATE SET job_id = EXCLUDED.job_id
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.workflow)
        .bind(&key.job_name)
        .bind(key.digest.algorithm.as_str())
        .bind(&key.digest.hex)
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup_fingerprint(&self, key: &FingerprintKey) -> DbResult<Option<ResourceId>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM fingerprints
            WHERE tenant_id = $1 AND workflow = $2 AND job_name = $3
              AND algorithm = $4 AND value = $5
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.workflow)
        .bind(&key.job_name)
        .bind(key.digest.algorithm.as_str())
        .bind(&key.digest.hex)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(ResourceId::from))
    }
}

#[async_trait]
impl GrantRepo for PgStore {
    async fn insert_grant(&self, grant: &Grant) -> DbResult<()> {
        let (subject_kind, subject_id) = match grant.subject {
            Subject::Identity(id) => ("identity", id),
            Subject::Group(id) => ("group", id),
        };
        sqlx::query(
            r#"
            INSERT INTO grants (id, subject_kind, subject_id, operation, resource_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(grant.id.as_uuid())
        .bind(subject_kind)
        .bind(subject_id.as_uuid())
        .bind(grant.operation.as_str())
        .bind(grant.resource_id.as_uuid())
        .bind(encode(grant)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn grants_for_identity(
        &self,
        identity: Identity,
        groups: &HashSet<ResourceId>,
    ) -> DbResult<Vec<Grant>> {
        let group_ids: Vec<Uuid> = groups.iter().map(|g| *g.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT data FROM grants
            WHERE (subject_kind = 'identity' AND subject_id = $1)
               OR (subject_kind = 'group' AND subject_id = ANY($2))
            "#,
        )
        .bind(identity.0.as_uuid())
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|row| decode(row.get("data"))).collect()
    }

    async fn groups_for_identity(&self, identity: Identity) -> DbResult<HashSet<ResourceId>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT group_id FROM group_members WHERE identity_id = $1")
                .bind(identity.0.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(ResourceId::from).collect())
    }

    async fn add_group_member(&self, group: ResourceId, identity: Identity) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO group_members (group_id, identity_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(group.as_uuid())
        .bind(identity.0.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_owner(&self, resource: ResourceId, owner: Identity) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO owners (resource_id, identity_id)
            VALUES ($1, $2)
            ON CONFLICT (resource_id) DO NOTHING
            "#,
        )
        .bind(resource.as_uuid())
        .bind(owner.0.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn owner_of(&self, resource: ResourceId) -> DbResult<Option<ResourceId>> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT identity_id FROM owners WHERE resource_id = $1")
                .bind(resource.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.map(ResourceId::from))
    }

    async fn resources_owned_by(&self, owner: Identity) -> DbResult<HashSet<ResourceId>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT resource_id FROM owners WHERE identity_id = $1")
                .bind(owner.0.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(ResourceId::from).collect())
    }
}

#[async_trait]
impl RunnerRepo for PgStore {
    async fn insert_runner(&self, runner: &Runner) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (id, tenant_id, key_fingerprint, data, etag)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(runner.id.as_uuid())
        .bind(runner.tenant_id.as_uuid())
        .bind(&runner.key_fingerprint)
        .bind(encode(runner)?)
        .bind(runner.etag)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "runner"))?;
        Ok(())
    }

    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner> {
        let row = sqlx::query("SELECT data, etag FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("runner {id}")))?;
        let mut runner: Runner = decode(row.get("data"))?;
        runner.etag = row.get("etag");
        Ok(runner)
    }

    async fn runner_by_key(&self, key_fingerprint: &str) -> DbResult<Option<Runner>> {
        let row = sqlx::query("SELECT data, etag FROM runners WHERE key_fingerprint = $1")
            .bind(key_fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let mut runner: Runner = decode(row.get("data"))?;
            runner.etag = row.get("etag");
            Ok(runner)
        })
        .transpose()
    }

    async fn update_runner(&self, runner: &Runner, expected_etag: i64) -> DbResult<Runner> {
        let mut updated = runner.clone();
        let returned: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE runners SET data = $2, etag = etag + 1
            WHERE id = $1 AND ($3 = -1 OR etag = $3)
            RETURNING etag
            "#,
        )
        .bind(runner.id.as_uuid())
        .bind(encode(runner)?)
        .bind(expected_etag)
        .fetch_optional(&self.pool)
        .await?;
        updated.etag = cas_outcome(
            &self.pool,
            "runners",
            *runner.id.as_uuid(),
            format!("runner {}", runner.id),
            returned,
        )
        .await?;
        Ok(updated)
    }
}

#[async_trait]
impl LogRepo for PgStore {
    async fn insert_descriptor(&self, descriptor: &LogDescriptor) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO log_descriptors (id, parent_id, subject_id, data, etag)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(descriptor.id.as_uuid())
        .bind(descriptor.parent_id.map(|p| *p.as_uuid()))
        .bind(descriptor.subject_id.as_uuid())
        .bind(encode(descriptor)?)
        .bind(descriptor.etag)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "log descriptor"))?;
        Ok(())
    }

    async fn get_descriptor(&self, id: ResourceId) -> DbResult<LogDescriptor> {
        let row = sqlx::query("SELECT data, etag FROM log_descriptors WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("log {id}")))?;
        let mut descriptor: LogDescriptor = decode(row.get("data"))?;
        descriptor.etag = row.get("etag");
        Ok(descriptor)
    }

    async fn descriptor_for_subject(
        &self,
        subject_id: ResourceId,
    ) -> DbResult<Option<LogDescriptor>> {
        let row = sqlx::query("SELECT data, etag FROM log_descriptors WHERE subject_id = $1")
            .bind(subject_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let mut descriptor: LogDescriptor = decode(row.get("data"))?;
            descriptor.etag = row.get("etag");
            Ok(descriptor)
        })
        .transpose()
    }

    async fn children_of(&self, id: ResourceId) -> DbResult<Vec<LogDescriptor>> {
        let rows = sqlx::query(
            "SELECT data, etag FROM log_descriptors WHERE parent_id = $1 ORDER BY id",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let mut descriptor: LogDescriptor = decode(row.get("data"))?;
                descriptor.etag = row.get("etag");
                Ok(descriptor)
            })
            .collect()
    }

    async fn update_descriptor(
        &self,
        descriptor: &LogDescriptor,
        expected_etag: i64,
    ) -> DbResult<LogDescriptor> {
        let mut updated = descriptor.clone();
        let returned: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE log_descriptors SET data = $2, etag = etag + 1
            WHERE id = $1 AND ($3 = -1 OR etag = $3)
            RETURNING etag
            "#,
        )
        .bind(descriptor.id.as_uuid())
        .bind(encode(descriptor)?)
        .bind(expected_etag)
        .fetch_optional(&self.pool)
        .await?;
        updated.etag = cas_outcome(
            &self.pool,
            "log_descriptors",
            *descriptor.id.as_uuid(),
            format!("log {}", descriptor.id),
            returned,
        )
        .await?;
        Ok(updated)
    }
}

/// Attempts at claiming the next per-build event sequence number before
/// giving up.
const SEQ_RETRIES: usize = 5;

#[async_trait]
impl EventRepo for PgStore {
    async fn append_event(&self, event: NewQueueEvent) -> DbResult<QueueEvent> {
        // Concurrent publishers for one build can both read the same
        // MAX(seq); the (build_id, seq) primary key rejects the loser,
        // which recomputes and tries again, like the etag CAS paths.
        for _ in 0..SEQ_RETRIES {
            let result = sqlx::query(
                r#"
                INSERT INTO queue_events (build_id, seq, kind, subject_id, subject_name, status, created_at)
                VALUES (
                    $1,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_events WHERE build_id = $1),
                    $2, $3, $4, $5, NOW()
                )
                RETURNING seq, created_at
                "#,
            )
            .bind(event.build_id.as_uuid())
            .bind(event.kind.as_str())
            .bind(event.subject_id.as_uuid())
            .bind(event.subject_name.clone())
            .bind(event.status.clone())
            .fetch_one(&self.pool)
            .await;
            let row = match result {
                Ok(row) => row,
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => continue,
                Err(err) => return Err(err.into()),
            };
            let seq: i64 = row.get("seq");
            return Ok(QueueEvent {
                seq: seq as u64,
                build_id: event.build_id,
                kind: event.kind,
                subject_id: event.subject_id,
                subject_name: event.subject_name.clone(),
                status: event.status.clone(),
                at: row.get("created_at"),
            });
        }
        Err(DbError::Stale(format!(
            "event sequence for build {}",
            event.build_id
        )))
    }

    async fn events_after(
        &self,
        build_id: ResourceId,
        after_seq: u64,
        limit: usize,
    ) -> DbResult<Vec<QueueEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, kind, subject_id, subject_name, status, created_at
            FROM queue_events
            WHERE build_id = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(after_seq as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let kind: String = row.get("kind");
                let subject_id: Uuid = row.get("subject_id");
                let kind: QueueEventKind = kind
                    .parse()
                    .map_err(|_| DbError::NotFound(format!("event kind {kind}")))?;
                Ok(QueueEvent {
                    seq: seq as u64,
                    build_id,
                    kind,
                    subject_id: ResourceId::from(subject_id),
                    subject_name: row.get("subject_name"),
                    status: row.get("status"),
                    at: row.get("created_at"),
                })
            })
            .collect()
    }
}
