/// Offline-first causal synchronization for field-operations dashboards.
/// Workers, admins and clients edit shared entities while disconnected; the
/// coordinator orders their edits with vector clocks and fans the result out.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod clock;
pub use clock::*;

mod config;
pub use config::*;

mod mutation;
pub use mutation::*;

mod entity;
pub use entity::*;

mod conflict;
pub use conflict::*;

mod store;
pub use store::*;

mod coordinator;
pub use coordinator::*;

mod protocol;
pub use protocol::*;

mod transport;
pub use transport::*;

mod offline;
pub use offline::*;

mod view;
pub use view::*;

mod runtime;
pub use runtime::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("entity not found: {0}")]
    UnknownEntity(EntityId),

    #[error("conflict {conflict} not found on entity {entity}")]
    UnknownConflict { entity: EntityId, conflict: ConflictId },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Dashboard instance identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Business entity identifier (task, building, work order, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Building,
    WorkOrder,
    Inspection,
    Inventory,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Building => "building",
            EntityKind::WorkOrder => "work_order",
            EntityKind::Inspection => "inspection",
            EntityKind::Inventory => "inventory",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "task" => Some(EntityKind::Task),
            "building" => Some(EntityKind::Building),
            "work_order" => Some(EntityKind::WorkOrder),
            "inspection" => Some(EntityKind::Inspection),
            "inventory" => Some(EntityKind::Inventory),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which dashboard an actor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Worker,
    Admin,
    Client,
}

impl ActorRole {
    /// Client dashboards are read-only
    pub fn can_write(&self) -> bool {
        !matches!(self, ActorRole::Client)
    }

    /// Tombstones and restores are reserved for administrators
    pub fn can_delete(&self) -> bool {
        matches!(self, ActorRole::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorProfile {
    pub id: ActorId,
    pub role: ActorRole,
}

impl ActorProfile {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: ActorId::new(id),
            role,
        }
    }

    pub fn worker(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Worker)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Admin)
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(id, ActorRole::Client)
    }
}
