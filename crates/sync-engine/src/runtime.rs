/// Per-dashboard runtime: owns the actor's queue and view, drains the queue
/// whenever the transport is reachable and applies pushes from the coordinator.
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    ActorId, ActorStateStore, ConflictSummary, EntityId, EntityKind, EntityView, LocalEdit, LocalView, MutationId,
    MutationOp, MutationRecord, OfflineQueue, Payload, QueueEntry, RejectReason, Result,
    RetryDecision, SubmitResponse, Subscription, SyncConfig, Transport, TransportError,
    VectorClock,
};

/// Notifications for the UI layer. Clocks stay inside the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    EntityChanged { entity_id: EntityId, payload: Payload },
    MutationFailed { entry: QueueEntry },
    MutationRejected { entry: QueueEntry, reason: RejectReason },
    ConnectivityChanged { online: bool },

    /// The entity's open conflicts changed; empty once all are acknowledged
    ConflictsChanged { entity_id: EntityId, conflicts: Vec<ConflictSummary> },
}

struct Shared {
    actor_id: ActorId,
    queue: Mutex<OfflineQueue>,
    view: Mutex<LocalView>,
    state_store: Option<ActorStateStore>,
    save_lock: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<UiEvent>,
    wake: Notify,
    online: watch::Sender<bool>,
    queue_len: watch::Sender<usize>,
}

impl Shared {
    fn emit(&self, event: UiEvent) {
        // The UI may have gone away; the engine keeps running without it.
        let _ = self.events.send(event);
    }

    fn emit_entity(&self, entity_id: &EntityId) {
        let payload = self
            .view
            .lock()
            .get(entity_id)
            .map(|view| view.payload)
            .unwrap_or_default();
        self.emit(UiEvent::EntityChanged {
            entity_id: entity_id.clone(),
            payload,
        });
    }

    fn publish_len(&self) {
        let len = self.queue.lock().len();
        self.queue_len.send_replace(len);
    }

    async fn persist(&self) {
        let Some(store) = &self.state_store else {
            return;
        };

        let _guard = self.save_lock.lock().await;
        let state = self.queue.lock().state();
        if let Err(err) = store.save(&state).await {
            error!(actor = %self.actor_id, error = %err, "failed to persist actor state");
        }
    }

    async fn enqueue(&self, edit: LocalEdit) -> MutationRecord {
        let record = self.queue.lock().enqueue(edit);
        self.view.lock().apply_local(&record);
        self.publish_len();
        self.emit_entity(&record.entity_id);

        self.persist().await;
        self.wake.notify_one();
        record
    }

    /// Apply coordinator state to the confirmed view, optionally settling a
    /// local edit, and report conflict changes to the UI
    fn confirm(&self, record: &MutationRecord, settled: Option<MutationId>) -> bool {
        let (changed, conflicts) = {
            let mut view = self.view.lock();
            let before = view.conflicts(&record.entity_id).to_vec();
            let changed = match settled {
                Some(id) => view.settle(id, record),
                None => view.apply(record),
            };
            let after = view.conflicts(&record.entity_id);
            (changed, (before.as_slice() != after).then(|| after.to_vec()))
        };

        if let Some(conflicts) = conflicts {
            if conflicts.is_empty() {
                info!(actor = %self.actor_id, entity = %record.entity_id, "conflicts cleared");
            } else {
                warn!(actor = %self.actor_id, entity = %record.entity_id, count = conflicts.len(), "entity contested");
            }
            self.emit(UiEvent::ConflictsChanged {
                entity_id: record.entity_id.clone(),
                conflicts,
            });
        }
        changed
    }

    /// A record pushed by the coordinator
    fn receive(&self, record: &MutationRecord) {
        self.queue.lock().observe(&record.clock);
        let changed = self.confirm(record, None);
        if changed {
            debug!(actor = %self.actor_id, entity = %record.entity_id, clock = %record.clock, "applied push");
            self.emit_entity(&record.entity_id);
        }
    }

    async fn catch_up<T: Transport>(&self, transport: &T) -> std::result::Result<usize, TransportError> {
        let known = self.view.lock().known_clocks();
        let catch_up = transport.catch_up(known).await?;

        let mut changed = Vec::new();
        for snapshot in &catch_up.snapshots {
            self.queue.lock().observe(&snapshot.clock);
            if self.confirm(snapshot, None) {
                changed.push(snapshot.entity_id.clone());
            }
        }

        for entity_id in &changed {
            self.emit_entity(entity_id);
        }

        info!(
            actor = %self.actor_id,
            snapshots = catch_up.snapshots.len(),
            changed = changed.len(),
            "caught up with coordinator"
        );
        Ok(changed.len())
    }

    /// Send queued records until the queue is empty or the transport is gone
    async fn drain<T: Transport>(&self, transport: &T) -> Option<TransportError> {
        loop {
            let record = self.queue.lock().begin_send();
            let Some(record) = record else {
                return None;
            };
            let id = record.id;
            let entity_id = record.entity_id.clone();

            match transport.send(record).await {
                Ok(SubmitResponse::Ack(ack)) => {
                    {
                        let mut queue = self.queue.lock();
                        queue.observe(&ack.resolved.clock);
                        queue.complete(id);
                    }
                    self.confirm(&ack.resolved, Some(id));
                    self.publish_len();
                    self.emit_entity(&entity_id);
                    self.persist().await;
                }

                Ok(SubmitResponse::Reject(reject)) => {
                    let entry = self.queue.lock().reject(id, &reject.reason);
                    self.view.lock().discard(id);
                    self.publish_len();
                    if let Some(entry) = entry {
                        self.emit(UiEvent::MutationRejected {
                            entry,
                            reason: reject.reason,
                        });
                    }
                    self.emit_entity(&entity_id);
                    self.persist().await;
                }

                Err(err) => {
                    let decision = self.queue.lock().fail_attempt(id, &err);
                    match decision {
                        RetryDecision::Retry(delay) => {
                            self.persist().await;
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::GiveUp(entry) => {
                            self.view.lock().discard(id);
                            self.publish_len();
                            self.emit(UiEvent::MutationFailed { entry });
                            self.emit_entity(&entity_id);
                            self.persist().await;
                        }
                        RetryDecision::Halt => {
                            self.persist().await;
                            return Some(err);
                        }
                    }
                }
            }
        }
    }
}

async fn listen(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            record = subscription.recv() => match record {
                Some(record) => shared.receive(&record),
                None => {
                    warn!(actor = %shared.actor_id, "subscription closed");
                    break;
                }
            },
        }
    }
}

async fn drive<T: Transport>(shared: Arc<Shared>, transport: T, mut shutdown: watch::Receiver<bool>) {
    let mut online = shared.online.subscribe();
    let mut needs_catch_up = true;

    loop {
        if transport.is_online() {
            if needs_catch_up {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    result = shared.catch_up(&transport) => match result {
                        Ok(_) => needs_catch_up = false,
                        Err(err) => warn!(actor = %shared.actor_id, error = %err, "catch-up failed"),
                    },
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                halted = shared.drain(&transport) => {
                    if let Some(err) = halted {
                        debug!(actor = %shared.actor_id, error = %err, "drain halted");
                        needs_catch_up = true;
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = shared.wake.notified() => {}
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if *online.borrow_and_update() {
                    needs_catch_up = true;
                }
            }
        }
    }

    debug!(actor = %shared.actor_id, "drain loop stopped");
}

/// One dashboard instance
pub struct ActorRuntime<T: Transport> {
    shared: Arc<Shared>,
    transport: T,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> ActorRuntime<T> {
    /// Restore persisted state, subscribe, and spawn the drain and listener tasks
    pub async fn start(
        actor_id: ActorId,
        transport: T,
        config: &SyncConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UiEvent>)> {
        let state_store = config
            .state_dir
            .as_ref()
            .map(|dir| ActorStateStore::new(dir));

        let queue = match &state_store {
            Some(store) => match store.load(&actor_id).await? {
                Some(state) => OfflineQueue::from_state(state, config.retry.clone()),
                None => OfflineQueue::new(actor_id.clone(), config.retry.clone()),
            },
            None => OfflineQueue::new(actor_id.clone(), config.retry.clone()),
        };

        let mut view = LocalView::new();
        for entry in queue.entries() {
            view.apply_local(&entry.record);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (online_tx, _) = watch::channel(transport.is_online());
        let (len_tx, _) = watch::channel(queue.len());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(actor = %actor_id, queued = queue.len(), clock = %queue.clock(), "starting actor runtime");

        let shared = Arc::new(Shared {
            actor_id: actor_id.clone(),
            queue: Mutex::new(queue),
            view: Mutex::new(view),
            state_store,
            save_lock: tokio::sync::Mutex::new(()),
            events: events_tx,
            wake: Notify::new(),
            online: online_tx,
            queue_len: len_tx,
        });

        let subscription = transport.subscribe(actor_id);
        let listener = tokio::spawn(listen(Arc::clone(&shared), subscription, shutdown_rx.clone()));
        let driver = tokio::spawn(drive(Arc::clone(&shared), transport.clone(), shutdown_rx));

        Ok((
            Self {
                shared,
                transport,
                shutdown: shutdown_tx,
                tasks: vec![listener, driver],
            },
            events_rx,
        ))
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.shared.actor_id
    }

    /// Set fields on an entity
    pub async fn edit(
        &self,
        entity_id: impl Into<String>,
        kind: EntityKind,
        deltas: Payload,
    ) -> Result<MutationId> {
        let edit = LocalEdit {
            entity_id: EntityId::new(entity_id),
            entity_kind: kind,
            op: MutationOp::Upsert,
            payload: deltas,
        };
        Ok(self.shared.enqueue(edit).await.id)
    }

    /// Queue any prepared edit
    pub async fn submit(&self, edit: LocalEdit) -> Result<MutationId> {
        Ok(self.shared.enqueue(edit).await.id)
    }

    pub async fn delete(&self, entity_id: impl Into<String>, kind: EntityKind) -> Result<MutationId> {
        self.submit(LocalEdit::tombstone(entity_id, kind)).await
    }

    pub async fn restore(&self, entity_id: impl Into<String>, kind: EntityKind) -> Result<MutationId> {
        self.submit(LocalEdit::restore(entity_id, kind)).await
    }

    /// Withdraw an edit that has not been sent yet
    pub async fn cancel(&self, id: MutationId) -> Result<QueueEntry> {
        let entry = self.shared.queue.lock().cancel(id)?;
        self.shared.view.lock().discard(id);
        self.shared.publish_len();
        self.shared.emit_entity(&entry.record.entity_id);
        self.shared.persist().await;
        Ok(entry)
    }

    pub fn set_online(&self, online: bool) {
        self.transport.set_online(online);
        let previous = self.shared.online.send_replace(online);
        if previous != online {
            info!(actor = %self.shared.actor_id, online, "connectivity changed");
            self.shared.emit(UiEvent::ConnectivityChanged { online });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.shared.online.borrow()
    }

    pub fn view(&self, entity_id: &EntityId) -> Option<EntityView> {
        self.shared.view.lock().get(entity_id)
    }

    pub fn entities(&self) -> Vec<EntityView> {
        let view = self.shared.view.lock();
        view.entity_ids()
            .iter()
            .filter_map(|id| view.get(id))
            .collect()
    }

    /// Open conflicts on an entity, as last confirmed by the coordinator
    pub fn conflicts(&self, entity_id: &EntityId) -> Vec<ConflictSummary> {
        self.shared.view.lock().conflicts(entity_id).to_vec()
    }

    pub fn failed_entries(&self) -> Vec<QueueEntry> {
        self.shared.queue.lock().failed().to_vec()
    }

    pub async fn dismiss_failed(&self, id: MutationId) -> Result<QueueEntry> {
        let entry = self.shared.queue.lock().dismiss_failed(id)?;
        self.shared.persist().await;
        Ok(entry)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn clock(&self) -> VectorClock {
        self.shared.queue.lock().clock().clone()
    }

    /// Resolves once every queued edit has been acknowledged, rejected or failed
    pub async fn settled(&self) {
        let mut len = self.shared.queue_len.subscribe();
        let _ = len.wait_for(|len| *len == 0).await;
    }

    /// Stop both tasks and write the final state
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        self.transport.unsubscribe(&self.shared.actor_id);

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(actor = %self.shared.actor_id, error = %err, "runtime task ended abnormally");
            }
        }

        self.shared.persist().await;
        info!(actor = %self.shared.actor_id, "actor runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActorProfile, LocalTransport, SyncCoordinator};
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (Arc<SyncCoordinator>, ActorRuntime<LocalTransport>, mpsc::UnboundedReceiver<UiEvent>) {
        let coordinator = Arc::new(SyncCoordinator::in_memory(&SyncConfig::default()));
        coordinator.register_actor(ActorProfile::worker("W"));
        let transport = LocalTransport::new(Arc::clone(&coordinator));
        let (runtime, events) = ActorRuntime::start(ActorId::from("W"), transport, &SyncConfig::default())
            .await
            .unwrap();
        (coordinator, runtime, events)
    }

    fn status(value: &str) -> Payload {
        Payload::from([("status".to_string(), json!(value))])
    }

    #[tokio::test]
    async fn test_edit_is_visible_immediately_and_reaches_coordinator() {
        let (coordinator, runtime, mut events) = setup().await;

        runtime.edit("task-1", EntityKind::Task, status("done")).await.unwrap();

        let task = EntityId::from("task-1");
        assert_eq!(runtime.view(&task).unwrap().field("status"), Some(&json!("done")));
        assert!(matches!(events.recv().await, Some(UiEvent::EntityChanged { .. })));

        tokio::time::timeout(Duration::from_secs(2), runtime.settled()).await.unwrap();
        let version = coordinator.read_model(&task).await.unwrap().unwrap();
        assert_eq!(version.field("status"), Some(&json!("done")));
        assert_eq!(runtime.clock(), VectorClock::of(&[("W", 1)]));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_edits_wait_for_connectivity() {
        let (coordinator, runtime, _events) = setup().await;
        runtime.set_online(false);

        let first = runtime.edit("task-1", EntityKind::Task, status("open")).await.unwrap();
        runtime.edit("task-1", EntityKind::Task, status("done")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.pending_count(), 2);
        assert!(coordinator.entities().await.unwrap().is_empty());

        let cancelled = runtime.cancel(first).await.unwrap();
        assert_eq!(cancelled.id(), first);

        runtime.set_online(true);
        tokio::time::timeout(Duration::from_secs(2), runtime.settled()).await.unwrap();

        let history = coordinator.history(&EntityId::from("task-1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].record.sequence_no, 2);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_edit_is_reported_and_reverted() {
        let (_, runtime, mut events) = setup().await;

        let id = runtime.delete("task-1", EntityKind::Task).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), runtime.settled()).await.unwrap();

        let rejected = loop {
            match events.recv().await {
                Some(UiEvent::MutationRejected { entry, reason }) => break (entry, reason),
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        };
        assert_eq!(rejected.0.id(), id);
        assert!(matches!(rejected.1, RejectReason::PermissionDenied { .. }));
        assert_eq!(runtime.failed_entries().len(), 1);
        assert!(runtime.view(&EntityId::from("task-1")).is_none());

        runtime.dismiss_failed(id).await.unwrap();
        assert!(runtime.failed_entries().is_empty());
        runtime.shutdown().await;
    }
}
