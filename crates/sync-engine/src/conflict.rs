/// Conflict detection and resolution for concurrent mutations
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::{ClockOrdering, EntityVersion, FieldWrite, MutationRecord, ResolverPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Concurrent writes to a field that disagree and may not be merged silently.
/// The automatic winner is already applied; this entry is kept for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub id: ConflictId,
    pub field: String,

    /// Latest concurrent record that touched the field
    pub record: MutationRecord,

    /// Concurrent writes, winner first
    pub candidates: Vec<FieldWrite>,

    pub detected_at: DateTime<Utc>,
}

impl PendingConflict {
    pub fn winner(&self) -> Option<&FieldWrite> {
        self.candidates.first()
    }
}

/// What a dashboard is told about an open conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSummary {
    pub id: ConflictId,
    pub field: String,

    /// Winner first
    pub candidates: Vec<FieldWrite>,

    pub detected_at: DateTime<Utc>,
}

impl ConflictSummary {
    pub fn winner(&self) -> Option<&FieldWrite> {
        self.candidates.first()
    }
}

impl From<&PendingConflict> for ConflictSummary {
    fn from(conflict: &PendingConflict) -> Self {
        Self {
            id: conflict.id,
            field: conflict.field.clone(),
            candidates: conflict.candidates.clone(),
            detected_at: conflict.detected_at,
        }
    }
}

/// What the resolver did with one incoming record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// The entity's clock already covers the record
    Stale,

    /// The record causally follows everything applied so far
    FastForward,

    /// The record was concurrent with the entity and merged field by field
    Merged { conflicts: Vec<ConflictId> },
}

impl Resolution {
    pub fn is_stale(&self) -> bool {
        matches!(self, Resolution::Stale)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Stale => "stale",
            Resolution::FastForward => "fast_forward",
            Resolution::Merged { .. } => "merged",
        }
    }
}

/// Field-level last-writer-wins merge over vector clocks.
///
/// For every field the entity keeps the writes that are not causally
/// superseded by another write. The visible value is the frontier write with
/// the largest `(produced_at, actor_id)` key. Because the frontier is the set
/// of maximal writes, the result does not depend on arrival order.
pub struct ConflictResolver {
    policy: ResolverPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ResolverPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResolverPolicy {
        &self.policy
    }

    /// Whether a concurrent disagreement on `field` becomes a pending conflict
    pub fn is_flagged(&self, field: &str) -> bool {
        !self.policy.silent_fields.contains(field)
    }

    /// Fold one record into the entity
    pub fn resolve(&self, version: &mut EntityVersion, record: &MutationRecord) -> Resolution {
        let ordering = record.clock.compare(&version.current_clock);

        if matches!(ordering, ClockOrdering::Before | ClockOrdering::Equal) {
            debug!(
                entity = %version.entity_id,
                mutation = %record.id,
                clock = %record.clock,
                current = %version.current_clock,
                "discarding stale mutation"
            );
            return Resolution::Stale;
        }

        let mut conflicts = Vec::new();
        for (field, value) in &record.payload {
            let write = FieldWrite::from_record(record, value.clone());
            if let Some(id) = self.write_field(version, field, write, record) {
                conflicts.push(id);
            }
        }

        version.current_clock = version.current_clock.merge(&record.clock);
        version.updated_at = Utc::now();

        if ordering == ClockOrdering::After {
            debug!(
                entity = %version.entity_id,
                mutation = %record.id,
                clock = %version.current_clock,
                "fast-forwarded entity"
            );
            Resolution::FastForward
        } else {
            debug!(
                entity = %version.entity_id,
                mutation = %record.id,
                clock = %version.current_clock,
                conflicts = conflicts.len(),
                "merged concurrent mutation"
            );
            Resolution::Merged { conflicts }
        }
    }

    /// Fold several records for the same entity, in the given order
    pub fn resolve_all(
        &self,
        version: &mut EntityVersion,
        records: &[MutationRecord],
    ) -> Vec<Resolution> {
        records
            .iter()
            .map(|record| self.resolve(version, record))
            .collect()
    }

    /// The record fanned out after resolution: the submitted record re-stamped
    /// with the entity's clock and carrying the entity's full resolved payload
    /// and open conflicts.
    pub fn resolved_record(version: &EntityVersion, record: &MutationRecord) -> MutationRecord {
        MutationRecord {
            clock: version.current_clock.clone(),
            payload: version.current_payload.clone(),
            open_conflicts: version.open_conflicts(),
            ..record.clone()
        }
    }

    fn write_field(
        &self,
        version: &mut EntityVersion,
        field: &str,
        write: FieldWrite,
        record: &MutationRecord,
    ) -> Option<ConflictId> {
        let candidates = {
            let frontier = version.field_writes.entry(field.to_string()).or_default();

            let superseded = frontier.iter().any(|existing| {
                existing.mutation_id == write.mutation_id
                    || existing.clock.dominates(&write.clock)
            });
            if superseded {
                return None;
            }

            frontier.retain(|existing| existing.clock.compare(&write.clock) != ClockOrdering::Before);
            frontier.push(write);
            frontier.sort_by(|a, b| b.precedence().cmp(&a.precedence()));
            frontier.clone()
        };

        let winner = candidates[0].value.clone();
        version.current_payload.insert(field.to_string(), winner);

        let disagree = candidates
            .iter()
            .skip(1)
            .any(|w| w.value != candidates[0].value);

        if disagree && self.is_flagged(field) {
            let now = Utc::now();
            if let Some(existing) = version
                .pending_conflicts
                .iter_mut()
                .find(|c| c.field == field)
            {
                existing.record = record.clone();
                existing.candidates = candidates;
                existing.detected_at = now;
                warn!(
                    entity = %version.entity_id,
                    field,
                    conflict = %existing.id,
                    "conflict widened by another concurrent write"
                );
                return Some(existing.id);
            }

            let conflict = PendingConflict {
                id: ConflictId::new(),
                field: field.to_string(),
                record: record.clone(),
                candidates,
                detected_at: now,
            };
            warn!(
                entity = %version.entity_id,
                field,
                conflict = %conflict.id,
                winner = %conflict.candidates[0].actor_id,
                "concurrent writes disagree, keeping last writer and flagging"
            );
            let id = conflict.id;
            version.pending_conflicts.push(conflict);
            return Some(id);
        }

        let before = version.pending_conflicts.len();
        version.pending_conflicts.retain(|c| c.field != field);
        if version.pending_conflicts.len() < before {
            info!(
                entity = %version.entity_id,
                field,
                "conflict cleared by a causally later write"
            );
        }
        None
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverPolicy::default())
    }
}
