/// Mutation records: the versioned unit of change exchanged between actors
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::{ActorId, ConflictSummary, EntityId, EntityKind, EntityVersion, VectorClock};

/// Reserved field written by tombstones and restores
pub const TOMBSTONE_FIELD: &str = "_deleted";

/// Actor id stamped on snapshots produced by the coordinator itself
pub const COORDINATOR_ACTOR: &str = "coordinator";

/// Field name to new value
pub type Payload = BTreeMap<String, Value>;

/// Unique mutation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub uuid::Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Set one or more fields
    Upsert,
    /// Logically delete the entity
    Tombstone,
    /// Undo a tombstone
    Restore,
    /// Full state pushed by the coordinator during catch-up
    Snapshot,
}

/// What the UI layer hands to the engine. Clocks are stamped internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEdit {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub op: MutationOp,
    pub payload: Payload,
}

impl LocalEdit {
    pub fn upsert(entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            entity_id: EntityId::new(entity_id),
            entity_kind,
            op: MutationOp::Upsert,
            payload: Payload::new(),
        }
    }

    /// Add a field delta
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    pub fn tombstone(entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            entity_id: EntityId::new(entity_id),
            entity_kind,
            op: MutationOp::Tombstone,
            payload: Payload::from([(TOMBSTONE_FIELD.to_string(), Value::Bool(true))]),
        }
    }

    pub fn restore(entity_id: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            entity_id: EntityId::new(entity_id),
            entity_kind,
            op: MutationOp::Restore,
            payload: Payload::from([(TOMBSTONE_FIELD.to_string(), Value::Bool(false))]),
        }
    }
}

/// Immutable, clock-stamped change to one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: MutationId,
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,

    /// Actor that produced the change
    pub actor_id: ActorId,

    /// Cross-actor causal fingerprint
    pub clock: VectorClock,

    pub op: MutationOp,
    pub payload: Payload,

    /// Wall-clock time on the producing device
    pub produced_at: DateTime<Utc>,

    /// Strictly increasing per producing actor
    pub sequence_no: u64,

    /// Conflicts open on the entity. Only set on records resolved by the coordinator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_conflicts: Vec<ConflictSummary>,
}

impl MutationRecord {
    pub fn new(actor_id: ActorId, sequence_no: u64, clock: VectorClock, edit: LocalEdit) -> Self {
        Self {
            id: MutationId::new(),
            entity_id: edit.entity_id,
            entity_kind: edit.entity_kind,
            actor_id,
            clock,
            op: edit.op,
            payload: edit.payload,
            produced_at: Utc::now(),
            sequence_no,
            open_conflicts: Vec::new(),
        }
    }

    pub fn with_produced_at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = produced_at;
        self
    }

    /// Full current state of a canonical entity, for catch-up
    pub fn snapshot(version: &EntityVersion) -> Self {
        Self {
            id: MutationId::new(),
            entity_id: version.entity_id.clone(),
            entity_kind: version.entity_kind,
            actor_id: ActorId::from(COORDINATOR_ACTOR),
            clock: version.current_clock.clone(),
            op: MutationOp::Snapshot,
            payload: version.current_payload.clone(),
            produced_at: version.updated_at,
            sequence_no: 0,
            open_conflicts: version.open_conflicts(),
        }
    }

    /// Last-writer-wins key: `(produced_at, actor_id)`, mutation id as final tie-break
    pub fn precedence(&self) -> (DateTime<Utc>, &ActorId, MutationId) {
        (self.produced_at, &self.actor_id, self.id)
    }

    pub fn touches(&self, field: &str) -> bool {
        self.payload.contains_key(field)
    }
}
