/// Canonical server-side entity state
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    ActorId, ConflictId, ConflictSummary, EntityId, EntityKind, MutationId, MutationRecord, Payload,
    PendingConflict, VectorClock, TOMBSTONE_FIELD,
};

/// One actor's write to one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub mutation_id: MutationId,
    pub actor_id: ActorId,
    pub clock: VectorClock,
    pub produced_at: DateTime<Utc>,
    pub value: Value,
}

impl FieldWrite {
    pub fn from_record(record: &MutationRecord, value: Value) -> Self {
        Self {
            mutation_id: record.id,
            actor_id: record.actor_id.clone(),
            clock: record.clock.clone(),
            produced_at: record.produced_at,
            value,
        }
    }

    pub fn precedence(&self) -> (DateTime<Utc>, &ActorId, MutationId) {
        (self.produced_at, &self.actor_id, self.mutation_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Uncontested,
    /// At least one pending conflict awaits acknowledgement
    Contested,
}

/// Canonical record for one business entity. Only the coordinator mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,

    /// Dominates every record merged into `current_payload`
    pub current_clock: VectorClock,

    pub current_payload: Payload,

    pub pending_conflicts: Vec<PendingConflict>,

    /// Per field, the writes no other write causally supersedes.
    /// The first entry is the visible winner.
    pub field_writes: BTreeMap<String, Vec<FieldWrite>>,

    pub updated_at: DateTime<Utc>,
}

impl EntityVersion {
    pub fn new(entity_id: EntityId, entity_kind: EntityKind) -> Self {
        Self {
            entity_id,
            entity_kind,
            current_clock: VectorClock::new(),
            current_payload: Payload::new(),
            pending_conflicts: Vec::new(),
            field_writes: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> EntityState {
        if self.pending_conflicts.is_empty() {
            EntityState::Uncontested
        } else {
            EntityState::Contested
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.current_payload.get(name)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.field(TOMBSTONE_FIELD), Some(Value::Bool(true)))
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&PendingConflict> {
        self.pending_conflicts.iter().find(|c| c.id == id)
    }

    pub fn open_conflicts(&self) -> Vec<ConflictSummary> {
        self.pending_conflicts.iter().map(ConflictSummary::from).collect()
    }

    /// Remove a pending conflict after a human has looked at it
    pub fn acknowledge_conflict(&mut self, id: ConflictId) -> Option<PendingConflict> {
        let index = self.pending_conflicts.iter().position(|c| c.id == id)?;
        self.updated_at = Utc::now();
        Some(self.pending_conflicts.remove(index))
    }
}
