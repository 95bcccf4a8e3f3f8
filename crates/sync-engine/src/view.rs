/// Dashboard-side read cache of entity state
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

use crate::{
    ConflictSummary, EntityId, EntityKind, MutationId, MutationRecord, Payload, VectorClock,
    TOMBSTONE_FIELD,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub entity_id: EntityId,
    pub entity_kind: EntityKind,
    pub clock: VectorClock,
    pub payload: Payload,

    /// Open conflicts as of the confirmed state
    #[serde(default)]
    pub conflicts: Vec<ConflictSummary>,
}

impl EntityView {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.field(TOMBSTONE_FIELD), Some(Value::Bool(true)))
    }

    pub fn is_contested(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// State confirmed by the coordinator, plus local edits still waiting for an ack
#[derive(Debug, Default)]
pub struct LocalView {
    confirmed: BTreeMap<EntityId, EntityView>,
    overlay: BTreeMap<EntityId, Vec<MutationRecord>>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a record resolved by the coordinator. Resolved records carry the
    /// entity's full state, so a newer one replaces the cached payload and
    /// conflicts.
    ///
    /// Returns false when the cached clock already covers the record.
    pub fn apply(&mut self, record: &MutationRecord) -> bool {
        match self.confirmed.get_mut(&record.entity_id) {
            Some(view) if view.clock.dominates(&record.clock) => {
                trace!(entity = %record.entity_id, mutation = %record.id, "already applied");
                false
            }
            Some(view) => {
                view.clock = view.clock.merge(&record.clock);
                view.payload = record.payload.clone();
                view.conflicts = record.open_conflicts.clone();
                true
            }
            None => {
                self.confirmed.insert(
                    record.entity_id.clone(),
                    EntityView {
                        entity_id: record.entity_id.clone(),
                        entity_kind: record.entity_kind,
                        clock: record.clock.clone(),
                        payload: record.payload.clone(),
                        conflicts: record.open_conflicts.clone(),
                    },
                );
                true
            }
        }
    }

    /// Show a local edit before the coordinator has seen it
    pub fn apply_local(&mut self, record: &MutationRecord) {
        self.overlay
            .entry(record.entity_id.clone())
            .or_default()
            .push(record.clone());
    }

    /// Drop a local edit from the overlay (acknowledged, rejected, failed or cancelled)
    pub fn discard(&mut self, mutation_id: MutationId) -> Option<MutationRecord> {
        let (entity_id, index) = self.overlay.iter().find_map(|(entity_id, records)| {
            records
                .iter()
                .position(|record| record.id == mutation_id)
                .map(|index| (entity_id.clone(), index))
        })?;

        let records = self.overlay.get_mut(&entity_id)?;
        let record = records.remove(index);
        if records.is_empty() {
            self.overlay.remove(&entity_id);
        }
        Some(record)
    }

    /// Replace an acknowledged local edit with the coordinator's resolved state
    pub fn settle(&mut self, mutation_id: MutationId, resolved: &MutationRecord) -> bool {
        self.discard(mutation_id);
        self.apply(resolved)
    }

    /// Confirmed state with pending local edits layered on top
    pub fn get(&self, entity_id: &EntityId) -> Option<EntityView> {
        let confirmed = self.confirmed.get(entity_id);
        let pending = self.overlay.get(entity_id);

        let mut view = match (confirmed, pending.and_then(|records| records.first())) {
            (Some(view), _) => view.clone(),
            (None, Some(first)) => EntityView {
                entity_id: entity_id.clone(),
                entity_kind: first.entity_kind,
                clock: VectorClock::new(),
                payload: Payload::new(),
                conflicts: Vec::new(),
            },
            (None, None) => return None,
        };

        let base = view.clock.clone();
        for record in pending.into_iter().flatten() {
            if base.dominates(&record.clock) {
                continue;
            }
            view.clock = view.clock.merge(&record.clock);
            view.payload
                .extend(record.payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Some(view)
    }

    pub fn confirmed(&self, entity_id: &EntityId) -> Option<&EntityView> {
        self.confirmed.get(entity_id)
    }

    /// Open conflicts on a confirmed entity
    pub fn conflicts(&self, entity_id: &EntityId) -> &[ConflictSummary] {
        self.confirmed
            .get(entity_id)
            .map(|view| view.conflicts.as_slice())
            .unwrap_or_default()
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .confirmed
            .keys()
            .chain(self.overlay.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Per-entity clocks for a catch-up request
    pub fn known_clocks(&self) -> BTreeMap<EntityId, VectorClock> {
        self.confirmed
            .iter()
            .map(|(id, view)| (id.clone(), view.clock.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.overlay.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorId, LocalEdit};
    use serde_json::json;

    fn resolved(clock: &[(&str, u64)], fields: &[(&str, &str)]) -> MutationRecord {
        let mut edit = LocalEdit::upsert("task-1", EntityKind::Task);
        for (field, value) in fields {
            edit = edit.set(*field, *value);
        }
        MutationRecord::new(ActorId::from("coordinator"), 0, VectorClock::of(clock), edit)
    }

    fn task() -> EntityId {
        EntityId::from("task-1")
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut view = LocalView::new();
        let record = resolved(&[("W", 1)], &[("status", "done")]);

        assert!(view.apply(&record));
        assert!(!view.apply(&record));
        assert_eq!(view.get(&task()).unwrap().field("status"), Some(&json!("done")));
    }

    #[test]
    fn test_older_state_never_overwrites_newer() {
        let mut view = LocalView::new();
        let newer = resolved(&[("W", 1), ("A", 1)], &[("status", "done"), ("priority", "high")]);
        let older = resolved(&[("W", 1)], &[("status", "done")]);

        view.apply(&newer);
        assert!(!view.apply(&older));

        let current = view.get(&task()).unwrap();
        assert_eq!(current.field("priority"), Some(&json!("high")));
        assert_eq!(current.clock, VectorClock::of(&[("W", 1), ("A", 1)]));
    }

    #[test]
    fn test_overlay_shows_pending_edits_until_settled() {
        let mut view = LocalView::new();
        view.apply(&resolved(&[("A", 1)], &[("status", "open")]));

        let local = MutationRecord::new(
            ActorId::from("W"),
            1,
            VectorClock::of(&[("W", 1), ("A", 1)]),
            LocalEdit::upsert("task-1", EntityKind::Task).set("status", "done"),
        );
        view.apply_local(&local);

        assert_eq!(view.get(&task()).unwrap().field("status"), Some(&json!("done")));
        assert_eq!(view.confirmed(&task()).unwrap().field("status"), Some(&json!("open")));
        assert_eq!(view.pending_count(), 1);

        let ack = resolved(&[("W", 1), ("A", 1)], &[("status", "done")]);
        assert!(view.settle(local.id, &ack));
        assert_eq!(view.pending_count(), 0);
        assert_eq!(view.get(&task()).unwrap().field("status"), Some(&json!("done")));
    }

    #[test]
    fn test_discarded_edit_reverts_to_confirmed() {
        let mut view = LocalView::new();
        let local = MutationRecord::new(
            ActorId::from("W"),
            1,
            VectorClock::of(&[("W", 1)]),
            LocalEdit::upsert("task-9", EntityKind::Task).set("status", "done"),
        );
        view.apply_local(&local);
        assert!(view.get(&EntityId::from("task-9")).is_some());

        assert!(view.discard(local.id).is_some());
        assert!(view.get(&EntityId::from("task-9")).is_none());
        assert!(view.entity_ids().is_empty());
    }

    #[test]
    fn test_known_clocks_cover_confirmed_entities_only() {
        let mut view = LocalView::new();
        view.apply(&resolved(&[("W", 2)], &[("status", "done")]));

        let known = view.known_clocks();
        assert_eq!(known.len(), 1);
        assert_eq!(known[&task()], VectorClock::of(&[("W", 2)]));
    }

    #[test]
    fn test_conflicts_follow_confirmed_state() {
        use crate::{ConflictId, ConflictSummary, FieldWrite};
        use chrono::Utc;

        let mut view = LocalView::new();
        let mut contested = resolved(&[("W", 1), ("A", 1)], &[("status", "cancelled")]);
        let write = FieldWrite::from_record(&contested, json!("cancelled"));
        contested.open_conflicts = vec![ConflictSummary {
            id: ConflictId::new(),
            field: "status".to_string(),
            candidates: vec![write],
            detected_at: Utc::now(),
        }];

        view.apply(&contested);
        assert!(view.get(&task()).unwrap().is_contested());
        assert_eq!(view.conflicts(&task()).len(), 1);

        let cleared = resolved(&[("W", 1), ("A", 1), ("coordinator", 1)], &[("status", "cancelled")]);
        assert!(view.apply(&cleared));
        assert!(!view.get(&task()).unwrap().is_contested());
        assert!(view.conflicts(&EntityId::from("task-2")).is_empty());
    }
}
