/// Canonical storage for entity versions and the mutation audit archive
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{EntityId, EntityVersion, MutationRecord, Resolution};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt entry for {entity}: {message}")]
    Corrupt { entity: EntityId, message: String },
}

/// How the coordinator treated an archived mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Stale,
    FastForward,
    Merged,
}

impl ArchiveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveOutcome::Stale => "stale",
            ArchiveOutcome::FastForward => "fast_forward",
            ArchiveOutcome::Merged => "merged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stale" => Some(ArchiveOutcome::Stale),
            "fast_forward" => Some(ArchiveOutcome::FastForward),
            "merged" => Some(ArchiveOutcome::Merged),
            _ => None,
        }
    }
}

impl From<&Resolution> for ArchiveOutcome {
    fn from(resolution: &Resolution) -> Self {
        match resolution {
            Resolution::Stale => ArchiveOutcome::Stale,
            Resolution::FastForward => ArchiveOutcome::FastForward,
            Resolution::Merged { .. } => ArchiveOutcome::Merged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedMutation {
    pub record: MutationRecord,
    pub outcome: ArchiveOutcome,
    pub archived_at: DateTime<Utc>,
}

/// Durable home of canonical entity state.
///
/// Calls are blocking; the coordinator runs them off the async executor.
/// `put` must be atomic per entity: a failed put leaves the prior version intact.
pub trait CanonicalStore: Send + Sync {
    fn get(&self, entity_id: &EntityId) -> Result<Option<EntityVersion>, StoreError>;

    fn put(&self, version: &EntityVersion) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<EntityVersion>, StoreError>;

    fn archive(&self, record: &MutationRecord, outcome: ArchiveOutcome) -> Result<(), StoreError>;

    /// Archived mutations for one entity, oldest first
    fn history(&self, entity_id: &EntityId) -> Result<Vec<ArchivedMutation>, StoreError>;
}

/// In-process store, used by tests and the simulator
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<BTreeMap<EntityId, EntityVersion>>,
    archive: RwLock<Vec<ArchivedMutation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl CanonicalStore for MemoryStore {
    fn get(&self, entity_id: &EntityId) -> Result<Option<EntityVersion>, StoreError> {
        Ok(self.entities.read().get(entity_id).cloned())
    }

    fn put(&self, version: &EntityVersion) -> Result<(), StoreError> {
        self.entities
            .write()
            .insert(version.entity_id.clone(), version.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<EntityVersion>, StoreError> {
        Ok(self.entities.read().values().cloned().collect())
    }

    fn archive(&self, record: &MutationRecord, outcome: ArchiveOutcome) -> Result<(), StoreError> {
        self.archive.write().push(ArchivedMutation {
            record: record.clone(),
            outcome,
            archived_at: Utc::now(),
        });
        Ok(())
    }

    fn history(&self, entity_id: &EntityId) -> Result<Vec<ArchivedMutation>, StoreError> {
        Ok(self
            .archive
            .read()
            .iter()
            .filter(|entry| &entry.record.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, EntityKind, LocalEdit, VectorClock};

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let id = EntityId::from("building-7");
        assert!(store.get(&id).unwrap().is_none());

        let mut version = EntityVersion::new(id.clone(), EntityKind::Building);
        version.current_clock = VectorClock::of(&[("A", 1)]);
        store.put(&version).unwrap();

        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.current_clock, VectorClock::of(&[("A", 1)]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_history_filters_by_entity() {
        let store = MemoryStore::new();
        let record = |entity: &str| {
            MutationRecord::new(
                ActorId::from("W"),
                1,
                VectorClock::of(&[("W", 1)]),
                LocalEdit::upsert(entity, EntityKind::Task).set("status", "done"),
            )
        };

        store.archive(&record("task-1"), ArchiveOutcome::FastForward).unwrap();
        store.archive(&record("task-2"), ArchiveOutcome::Merged).unwrap();
        store.archive(&record("task-1"), ArchiveOutcome::Stale).unwrap();

        let history = store.history(&EntityId::from("task-1")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, ArchiveOutcome::FastForward);
        assert_eq!(history[1].outcome, ArchiveOutcome::Stale);
    }

    #[test]
    fn test_outcome_labels_round_trip() {
        for outcome in [ArchiveOutcome::Stale, ArchiveOutcome::FastForward, ArchiveOutcome::Merged] {
            assert_eq!(ArchiveOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(ArchiveOutcome::parse("bogus"), None);
    }
}
