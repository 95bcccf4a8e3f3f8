/// Vector clocks for causal ordering of mutations across actors
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::ActorId;

/// Outcome of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

/// Per-actor counters. Actors missing from the map count as zero.
///
/// Every operation returns a new clock, so a clock captured on a
/// `MutationRecord` is never aliased by later increments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<ActorId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            counters: BTreeMap::new(),
        }
    }

    /// Build a clock from `(actor, counter)` pairs
    pub fn of(pairs: &[(&str, u64)]) -> Self {
        pairs
            .iter()
            .map(|(actor, count)| (ActorId::from(*actor), *count))
            .collect()
    }

    /// Get the current value for an actor
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.counters.get(actor).copied().unwrap_or(0)
    }

    /// A copy of this clock with `actor` raised by one
    pub fn increment(&self, actor: &ActorId) -> Self {
        let mut next = self.clone();
        *next.counters.entry(actor.clone()).or_insert(0) += 1;
        next
    }

    /// Component-wise maximum over the union of actors
    pub fn merge(&self, other: &VectorClock) -> Self {
        let mut merged = self.clone();
        for (actor, &count) in &other.counters {
            let current = merged.counters.entry(actor.clone()).or_insert(0);
            *current = (*current).max(count);
        }
        merged
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for actor in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.get(actor);
            let theirs = other.get(actor);

            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }

            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Check if this clock happened before another
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Check if this clock is concurrent with another
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True when this clock is after or equal to `other`
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    pub fn actors(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.counters
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(actor, count)| (actor, *count))
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|count| *count == 0)
    }
}

impl FromIterator<(ActorId, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (ActorId, u64)>>(iter: I) -> Self {
        Self {
            counters: iter.into_iter().filter(|(_, count)| *count > 0).collect(),
        }
    }
}

// Zero counters and absent actors are the same point in time.
impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }
}

impl Eq for VectorClock {}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (actor, count)) in self.actors().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", actor, count)?;
        }
        f.write_str("}")
    }
}
