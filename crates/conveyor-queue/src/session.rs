//! Runner sessions: server-side state of connected runners.
//!
//! A runner authenticates with its client-certificate key fingerprint.
//! The session tracks capabilities, current leases, and an optional
//! pinned build for jobinator sessions (a runner that only drains one
//! build's jobs while submitting more of them).

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

use conveyor_core::runner::{Capabilities, Runner};
use conveyor_core::{ETAG_ANY, Error, ResourceId, Result};
use conveyor_db::RunnerRepo;

#[derive(Debug, Clone)]
pub struct RunnerSession {
    pub runner_id: ResourceId,
    pub capabilities: Capabilities,
    /// When set, dequeue skips jobs of other builds for this runner.
    pub active_build: Option<ResourceId>,
    pub leases: HashSet<ResourceId>,
    pub connected_at: DateTime<Utc>,
}

pub struct RunnerRegistry {
    store: Arc<dyn RunnerRepo>,
    sessions: Mutex<HashMap<ResourceId, RunnerSession>>,
}

impl RunnerRegistry {
    pub fn new(store: Arc<dyn RunnerRepo>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new runner for a tenant.
    pub async fn register(
        &self,
        tenant_id: ResourceId,
        name: &str,
        key_fingerprint: &str,
        capabilities: Capabilities,
    ) -> Result<Runner> {
        let runner = Runner::new(tenant_id, name, key_fingerprint, capabilities);
        self.store.insert_runner(&runner).await?;
        info!(runner_id = %runner.id, name, "registered runner");
        Ok(runner)
    }

    /// Open a session for the runner behind `key_fingerprint`. An unknown
    /// key is unauthorized; a known but disabled runner is reported as a
    /// disabled account.
    pub async fn connect(&self, key_fingerprint: &str) -> Result<RunnerSession> {
        let runner = self
            .store
            .runner_by_key(key_fingerprint)
            .await?
            .ok_or(Error::Unauthorized)?;
        if !runner.enabled {
            return Err(Error::AccountDisabled(runner.name.clone()));
        }
        let session = RunnerSession {
            runner_id: runner.id,
            capabilities: runner.capabilities.clone(),
            active_build: None,
            leases: HashSet::new(),
            connected_at: Utc::now(),
        };
        self.sessions
            .lock()
            .expect("runner registry lock poisoned")
            .insert(runner.id, session.clone());
        Ok(session)
    }

    pub fn session(&self, runner_id: ResourceId) -> Option<RunnerSession> {
        self.sessions
            .lock()
            .expect("runner registry lock poisoned")
            .get(&runner_id)
            .cloned()
    }

    /// Pin (or unpin) the session to one build.
    pub fn pin_build(&self, runner_id: ResourceId, build_id: Option<ResourceId>) {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("runner registry lock poisoned")
            .get_mut(&runner_id)
        {
            session.active_build = build_id;
        }
    }

    pub fn record_lease(&self, runner_id: ResourceId, job_id: ResourceId) {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("runner registry lock poisoned")
            .get_mut(&runner_id)
        {
            session.leases.insert(job_id);
        }
    }

    pub fn release_lease(&self, runner_id: ResourceId, job_id: ResourceId) {
        if let Some(session) = self
            .sessions
            .lock()
            .expect("runner registry lock poisoned")
            .get_mut(&runner_id)
        {
            session.leases.remove(&job_id);
        }
    }

    /// Runners may report capabilities at any time; this is a
    /// server-internal refresh, so the magic etag applies. Downgrades do
    /// not revoke existing leases.
    pub async fn update_capabilities(
        &self,
        runner_id: ResourceId,
        capabilities: Capabilities,
    ) -> Result<Runner> {
        let mut runner = self.store.get_runner(runner_id).await?;
        runner.capabilities = capabilities.clone();
        let stored = self.store.update_runner(&runner, ETAG_ANY).await?;
        if let Some(session) = self
            .sessions
            .lock()
            .expect("runner registry lock poisoned")
            .get_mut(&runner_id)
        {
            session.capabilities = capabilities;
        }
        Ok(stored)
    }

    pub fn disconnect(&self, runner_id: ResourceId) {
        self.sessions
            .lock()
            .expect("runner registry lock poisoned")
            .remove(&runner_id);
    }
}
