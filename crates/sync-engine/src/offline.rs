/// Offline support: buffer local mutations while disconnected and replay them
/// in order once the coordinator is reachable again.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::{
    Ack, ActorId, LocalEdit, MutationId, MutationRecord, MutationSink, RejectReason, Result,
    RetryPolicy, SubmitResponse, TransportError, VectorClock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("mutation {id} cannot be cancelled while {state:?}")]
    NotCancellable { id: MutationId, state: EntryState },

    #[error("mutation not found: {0}")]
    UnknownMutation(MutationId),

    #[error("state file for {expected} holds state of {found}")]
    ForeignState { expected: ActorId, found: ActorId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub record: MutationRecord,
    pub enqueued_at: DateTime<Utc>,

    /// Delivery attempts that reached the transport
    pub attempts: u32,

    pub state: EntryState,
    pub last_error: Option<String>,
}

impl QueueEntry {
    fn new(record: MutationRecord) -> Self {
        Self {
            record,
            enqueued_at: Utc::now(),
            attempts: 0,
            state: EntryState::Pending,
            last_error: None,
        }
    }

    pub fn id(&self) -> MutationId {
        self.record.id
    }
}

/// What to do after a failed delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Back off, then resend the same entry
    Retry(Duration),

    /// Attempts exhausted; the entry moved to the failed list
    GiveUp(QueueEntry),

    /// Connectivity lost; stop draining until it returns
    Halt,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub acknowledged: Vec<Ack>,
    pub rejected: Vec<(QueueEntry, RejectReason)>,
    pub failed: Vec<QueueEntry>,

    /// Set when the drain stopped because the transport went offline
    pub halted: Option<TransportError>,
}

/// Durable per-actor state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorState {
    pub actor_id: ActorId,
    pub clock: VectorClock,
    pub next_sequence: u64,
    pub queue: Vec<QueueEntry>,
    pub failed: Vec<QueueEntry>,
    pub saved_at: DateTime<Utc>,
}

/// Ordered buffer of one actor's unacknowledged mutations.
///
/// Only the head entry is ever in flight, so records reach the coordinator
/// in the order they were produced.
#[derive(Debug)]
pub struct OfflineQueue {
    actor_id: ActorId,
    clock: VectorClock,
    next_sequence: u64,
    entries: VecDeque<QueueEntry>,
    failed: Vec<QueueEntry>,
    retry: RetryPolicy,
}

impl OfflineQueue {
    pub fn new(actor_id: ActorId, retry: RetryPolicy) -> Self {
        Self {
            actor_id,
            clock: VectorClock::new(),
            next_sequence: 1,
            entries: VecDeque::new(),
            failed: Vec::new(),
            retry,
        }
    }

    /// Rebuild from persisted state. Entries that were in flight when the
    /// actor stopped are sent again.
    pub fn from_state(state: ActorState, retry: RetryPolicy) -> Self {
        let entries: VecDeque<QueueEntry> = state
            .queue
            .into_iter()
            .map(|mut entry| {
                if entry.state == EntryState::InFlight {
                    debug!(mutation = %entry.id(), "reverting in-flight entry to pending");
                    entry.state = EntryState::Pending;
                }
                entry
            })
            .collect();

        info!(
            actor = %state.actor_id,
            clock = %state.clock,
            queued = entries.len(),
            failed = state.failed.len(),
            "restored offline queue"
        );

        Self {
            actor_id: state.actor_id,
            clock: state.clock,
            next_sequence: state.next_sequence,
            entries,
            failed: state.failed,
            retry,
        }
    }

    pub fn state(&self) -> ActorState {
        ActorState {
            actor_id: self.actor_id.clone(),
            clock: self.clock.clone(),
            next_sequence: self.next_sequence,
            queue: self.entries.iter().cloned().collect(),
            failed: self.failed.clone(),
            saved_at: Utc::now(),
        }
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn failed(&self) -> &[QueueEntry] {
        &self.failed
    }

    /// Stamp a local edit with the next clock and append it. Never blocks.
    pub fn enqueue(&mut self, edit: LocalEdit) -> MutationRecord {
        self.clock = self.clock.increment(&self.actor_id);
        let sequence_no = self.next_sequence;
        self.next_sequence += 1;

        let record = MutationRecord::new(self.actor_id.clone(), sequence_no, self.clock.clone(), edit);
        debug!(
            actor = %self.actor_id,
            mutation = %record.id,
            entity = %record.entity_id,
            clock = %record.clock,
            "queued mutation"
        );

        self.entries.push_back(QueueEntry::new(record.clone()));
        record
    }

    /// Drop a queued entry that has not been handed to the transport yet
    pub fn cancel(&mut self, id: MutationId) -> std::result::Result<QueueEntry, QueueError> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id() == id)
            .ok_or(QueueError::UnknownMutation(id))?;

        let state = self.entries[index].state;
        if state != EntryState::Pending {
            return Err(QueueError::NotCancellable { id, state });
        }

        let entry = self
            .entries
            .remove(index)
            .ok_or(QueueError::UnknownMutation(id))?;
        info!(actor = %self.actor_id, mutation = %id, "cancelled queued mutation");
        Ok(entry)
    }

    /// Fold a clock seen from the coordinator into the actor's clock
    pub fn observe(&mut self, clock: &VectorClock) {
        self.clock = self.clock.merge(clock);
    }

    /// Mark the head entry in flight and return its record
    pub fn begin_send(&mut self) -> Option<MutationRecord> {
        let entry = self.entries.front_mut()?;
        entry.state = EntryState::InFlight;
        entry.attempts += 1;
        Some(entry.record.clone())
    }

    /// The coordinator acknowledged the head entry
    pub fn complete(&mut self, id: MutationId) -> Option<QueueEntry> {
        let mut entry = self.take_head(id)?;
        entry.state = EntryState::Acknowledged;
        debug!(actor = %self.actor_id, mutation = %id, attempts = entry.attempts, "mutation acknowledged");
        Some(entry)
    }

    /// The coordinator refused the head entry; resending will not help
    pub fn reject(&mut self, id: MutationId, reason: &RejectReason) -> Option<QueueEntry> {
        let mut entry = self.take_head(id)?;
        entry.state = EntryState::Failed;
        entry.last_error = Some(reason.to_string());
        error!(actor = %self.actor_id, mutation = %id, %reason, "mutation rejected");
        self.failed.push(entry.clone());
        Some(entry)
    }

    /// Record a failed delivery of the head entry
    pub fn fail_attempt(&mut self, id: MutationId, err: &TransportError) -> RetryDecision {
        let max_attempts = self.retry.max_attempts;
        let Some(entry) = self.entries.front_mut().filter(|entry| entry.id() == id) else {
            return RetryDecision::Halt;
        };

        entry.last_error = Some(err.to_string());

        if err.is_offline() {
            // Never reached the coordinator, so the attempt does not count.
            entry.attempts = entry.attempts.saturating_sub(1);
            entry.state = EntryState::Pending;
            debug!(actor = %self.actor_id, mutation = %id, "offline, halting drain");
            return RetryDecision::Halt;
        }

        if entry.attempts >= max_attempts {
            let attempts = entry.attempts;
            let Some(mut entry) = self.entries.pop_front() else {
                return RetryDecision::Halt;
            };
            entry.state = EntryState::Failed;
            error!(
                actor = %self.actor_id,
                mutation = %id,
                attempts,
                error = %err,
                "giving up on mutation"
            );
            self.failed.push(entry.clone());
            return RetryDecision::GiveUp(entry);
        }

        entry.state = EntryState::Pending;
        let delay = self.retry.backoff(entry.attempts);
        warn!(
            actor = %self.actor_id,
            mutation = %id,
            attempt = entry.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "delivery failed, retrying"
        );
        RetryDecision::Retry(delay)
    }

    /// Remove a failed entry once the UI has dealt with it
    pub fn dismiss_failed(&mut self, id: MutationId) -> std::result::Result<QueueEntry, QueueError> {
        let index = self
            .failed
            .iter()
            .position(|entry| entry.id() == id)
            .ok_or(QueueError::UnknownMutation(id))?;
        Ok(self.failed.remove(index))
    }

    /// Send every queued entry in order, waiting for each acknowledgement
    pub async fn drain<S: MutationSink>(&mut self, sink: &S) -> DrainReport {
        let mut report = DrainReport::default();

        while let Some(record) = self.begin_send() {
            let id = record.id;
            match sink.send(record).await {
                Ok(SubmitResponse::Ack(ack)) => {
                    self.observe(&ack.resolved.clock);
                    self.complete(id);
                    report.acknowledged.push(ack);
                }
                Ok(SubmitResponse::Reject(reject)) => {
                    if let Some(entry) = self.reject(id, &reject.reason) {
                        report.rejected.push((entry, reject.reason));
                    }
                }
                Err(err) => match self.fail_attempt(id, &err) {
                    RetryDecision::Retry(delay) => tokio::time::sleep(delay).await,
                    RetryDecision::GiveUp(entry) => report.failed.push(entry),
                    RetryDecision::Halt => {
                        report.halted = Some(err);
                        break;
                    }
                },
            }
        }

        report
    }

    fn take_head(&mut self, id: MutationId) -> Option<QueueEntry> {
        if self.entries.front().map(QueueEntry::id) == Some(id) {
            self.entries.pop_front()
        } else {
            warn!(actor = %self.actor_id, mutation = %id, "reply for a mutation that is not at the head");
            None
        }
    }
}

/// Persists actor state as one JSON file per actor
#[derive(Debug, Clone)]
pub struct ActorStateStore {
    dir: PathBuf,
}

impl ActorStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Hex keeps distinct ids on distinct files whatever characters they use
    pub fn path(&self, actor_id: &ActorId) -> PathBuf {
        self.dir
            .join(format!("actor_{}.json", hex::encode(actor_id.as_str())))
    }

    /// Write to a temporary file, then rename over the previous state
    pub async fn save(&self, state: &ActorState) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.path(&state.actor_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, actor_id: &ActorId) -> Result<Option<ActorState>> {
        let path = self.path(actor_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).await?;
        let state: ActorState = serde_json::from_str(&json)?;
        if &state.actor_id != actor_id {
            error!(expected = %actor_id, found = %state.actor_id, path = %path.display(), "actor state belongs to another actor");
            return Err(QueueError::ForeignState {
                expected: actor_id.clone(),
                found: state.actor_id,
            }
            .into());
        }
        Ok(Some(state))
    }

    pub async fn delete(&self, actor_id: &ActorId) -> Result<()> {
        let path = self.path(actor_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
