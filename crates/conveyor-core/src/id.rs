//! Typed identifiers.
//!
//! Every persisted resource (build, job, step, artifact, runner, grant,
//! log descriptor) shares one UUIDv7-backed id. The time-ordered layout is
//! load-bearing: the dequeue scan breaks FIFO ties on it, keyset cursors
//! use it as the boundary tie-breaker, and `children_of` listings sort by
//! it. Log writers additionally mint a random [`SessionId`] per
//! instantiation to namespace their chunk keys.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id of a persisted resource. Ordered the way the rows were created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Mint the id for a resource being created now.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Borrow the inner UUID, for binding into store queries.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

/// Ids read back from a store column.
impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier for one log-writer instantiation.
///
/// Random (UUIDv4) rather than time-ordered: the session component of a
/// chunk key only has to be collision-free across concurrent writers, and
/// 128 random bits make that safe without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Render without hyphens, the form embedded in chunk keys.
    pub fn as_simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_ids_are_unique() {
        let a = ResourceId::new();
        let b = ResourceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn resource_id_round_trips_through_string() {
        let id = ResourceId::new();
        let parsed: ResourceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_id_simple_form_round_trips() {
        let s = SessionId::new();
        let parsed: SessionId = s.as_simple().parse().unwrap();
        assert_eq!(s, parsed);
    }
}
