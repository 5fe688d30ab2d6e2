//! Authorization filter: grants, identities, and the predicate applied to
//! every externally-originated operation.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::ResourceId;

/// The authenticated principal behind an operation: a user account or a
/// runner. Tenancy is expressed as ownership, so no tenant field is needed
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Identity(pub ResourceId);

/// Operations that grants are expressed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Update,
    Delete,
    Dequeue,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Dequeue => "dequeue",
        }
    }
}

/// Who a grant is issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Subject {
    Identity(ResourceId),
    Group(ResourceId),
}

/// One (subject, operation, resource) grant. The effective grant set for an
/// identity is the union of its direct grants, the grants of every group it
/// belongs to, and ownership (the creator of a resource holds every
/// operation on it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: ResourceId,
    pub granted_by: ResourceId,
    pub subject: Subject,
    pub operation: Operation,
    pub resource_id: ResourceId,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn new(
        granted_by: ResourceId,
        subject: Subject,
        operation: Operation,
        resource_id: ResourceId,
    ) -> Self {
        Self {
            id: ResourceId::new(),
            granted_by,
            subject,
            operation,
            resource_id,
            created_at: Utc::now(),
        }
    }
}

/// Store-level rewrite of a search: either unrestricted or an explicit set
/// of resource ids the searcher may see.
#[derive(Debug, Clone)]
pub enum AccessFilter {
    All,
    Ids(HashSet<ResourceId>),
}

impl AccessFilter {
    pub fn permits(&self, id: &ResourceId) -> bool {
        match self {
            AccessFilter::All => true,
            AccessFilter::Ids(ids) => ids.contains(id),
        }
    }
}

/// Point evaluation of the grant set.
///
/// `grants` must already be restricted to the subjects relevant to the
/// identity (itself plus its groups); `owner` is the recorded creator of
/// the resource, when known.
pub fn evaluate(
    identity: Identity,
    groups: &HashSet<ResourceId>,
    grants: &[Grant],
    operation: Operation,
    resource_id: ResourceId,
    owner: Option<ResourceId>,
) -> bool {
    if owner == Some(identity.0) {
        return true;
    }
    grants.iter().any(|g| {
        g.operation == operation
            && g.resource_id == resource_id
            && match g.subject {
                Subject::Identity(id) => id == identity.0,
                Subject::Group(id) => groups.contains(&id),
            }
    })
}

/// Collect the resource ids a grant set permits for one operation. Combined
/// with owned resources by the caller to build an [`AccessFilter`].
pub fn granted_resources(
    identity: Identity,
    groups: &HashSet<ResourceId>,
    grants: &[Grant],
    operation: Operation,
) -> HashSet<ResourceId> {
    grants
        .iter()
        .filter(|g| g.operation == operation)
        .filter(|g| match g.subject {
            Subject::Identity(id) => id == identity.0,
            Subject::Group(id) => groups.contains(&id),
        })
        .map(|g| g.resource_id)
        .collect()
}
