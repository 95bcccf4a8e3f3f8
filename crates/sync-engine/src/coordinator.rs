/// Coordinating service: orders submissions per entity, persists the resolved
/// state and fans it out to every subscribed dashboard.
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    ActorId, ActorProfile, ArchiveOutcome, ArchivedMutation, CanonicalStore, ConflictId,
    ConflictResolver, CoordinatorConfig, EntityId, EntityVersion, MemoryStore, MutationId,
    MutationOp, MutationRecord, PendingConflict, Resolution, Result, StoreError, SyncConfig,
    SyncError, VectorClock, COORDINATOR_ACTOR, TOMBSTONE_FIELD,
};

type EntityLocks = Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive access to one entity. The lock entry is dropped from the
/// registry once nobody holds or waits for it.
struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    entity_id: EntityId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if locks
            .get(&self.entity_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.entity_id);
        }
    }
}

/// Successful submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub mutation_id: MutationId,
    pub resolution: Resolution,

    /// The entity's canonical state after this submission
    pub resolved: MutationRecord,

    pub server_clock: VectorClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownActor { actor: ActorId },
    PermissionDenied { message: String },
    InvalidMutation { message: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownActor { actor } => write!(f, "unknown actor {}", actor),
            RejectReason::PermissionDenied { message } => write!(f, "permission denied: {}", message),
            RejectReason::InvalidMutation { message } => write!(f, "invalid mutation: {}", message),
        }
    }
}

/// Submission refused before it reached the resolver. Retrying will not help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub mutation_id: MutationId,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitResponse {
    Ack(Ack),
    Reject(Reject),
}

impl SubmitResponse {
    pub fn mutation_id(&self) -> MutationId {
        match self {
            SubmitResponse::Ack(ack) => ack.mutation_id,
            SubmitResponse::Reject(reject) => reject.mutation_id,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, SubmitResponse::Ack(_))
    }
}

/// Snapshots a reconnecting actor has not seen yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchUp {
    pub snapshots: Vec<MutationRecord>,
    pub server_clock: VectorClock,
}

/// Resolved records pushed to one actor
pub struct Subscription {
    actor_id: ActorId,
    rx: mpsc::UnboundedReceiver<MutationRecord>,
}

impl Subscription {
    pub(crate) fn from_channel(actor_id: ActorId, rx: mpsc::UnboundedReceiver<MutationRecord>) -> Self {
        Self { actor_id, rx }
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    /// Next resolved record, `None` once the coordinator drops the subscription
    pub async fn recv(&mut self) -> Option<MutationRecord> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MutationRecord> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = MutationRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn CanonicalStore>,
    resolver: ConflictResolver,
    config: CoordinatorConfig,
    actors: RwLock<HashMap<ActorId, ActorProfile>>,
    server_clock: Mutex<VectorClock>,
    entity_locks: EntityLocks,
    subscribers: RwLock<HashMap<ActorId, mpsc::UnboundedSender<MutationRecord>>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn CanonicalStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(config.resolver.clone()),
            config: config.coordinator.clone(),
            actors: RwLock::new(HashMap::new()),
            server_clock: Mutex::new(VectorClock::new()),
            entity_locks: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn in_memory(config: &SyncConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Recover the server clock from persisted entities
    pub async fn restore_server_clock(&self) -> Result<VectorClock> {
        let versions = self.blocking(|store| store.list()).await?;
        let mut clock = self.server_clock.lock();
        for version in &versions {
            *clock = clock.merge(&version.current_clock);
        }
        info!(entities = versions.len(), clock = %clock, "restored server clock");
        Ok(clock.clone())
    }

    pub fn register_actor(&self, profile: ActorProfile) {
        info!(actor = %profile.id, role = ?profile.role, "registered actor");
        self.actors.write().insert(profile.id.clone(), profile);
    }

    pub fn actor(&self, actor_id: &ActorId) -> Option<ActorProfile> {
        self.actors.read().get(actor_id).cloned()
    }

    /// Replaces any earlier subscription for the same actor
    pub fn subscribe(&self, actor_id: ActorId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().insert(actor_id.clone(), tx);
        debug!(actor = %actor_id, "subscribed");
        Subscription::from_channel(actor_id, rx)
    }

    pub fn unsubscribe(&self, actor_id: &ActorId) {
        if self.subscribers.write().remove(actor_id).is_some() {
            debug!(actor = %actor_id, "unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn server_clock(&self) -> VectorClock {
        self.server_clock.lock().clone()
    }

    /// Resolve one record against the canonical entity.
    ///
    /// Returns `Err` only when the store fails; nothing is persisted or
    /// broadcast in that case and the record may be resubmitted.
    pub async fn submit(&self, record: MutationRecord) -> Result<SubmitResponse> {
        if let Err(reason) = self.authorize(&record) {
            warn!(mutation = %record.id, actor = %record.actor_id, %reason, "rejected mutation");
            return Ok(SubmitResponse::Reject(Reject {
                mutation_id: record.id,
                reason,
            }));
        }

        let _guard = self.lock_entity(&record.entity_id).await;

        let entity_id = record.entity_id.clone();
        let existing = self.blocking(move |store| store.get(&entity_id)).await?;

        let mut version = match existing {
            Some(version) if version.entity_kind != record.entity_kind => {
                let reason = RejectReason::InvalidMutation {
                    message: format!(
                        "{} is a {}, not a {}",
                        version.entity_id, version.entity_kind, record.entity_kind
                    ),
                };
                warn!(mutation = %record.id, %reason, "rejected mutation");
                return Ok(SubmitResponse::Reject(Reject {
                    mutation_id: record.id,
                    reason,
                }));
            }
            Some(version) => version,
            None => EntityVersion::new(record.entity_id.clone(), record.entity_kind),
        };

        let was_contested = !version.pending_conflicts.is_empty();
        let resolution = self.resolver.resolve(&mut version, &record);
        let resolved = ConflictResolver::resolved_record(&version, &record);

        if !resolution.is_stale() {
            let snapshot = version.clone();
            if let Err(err) = self.blocking(move |store| store.put(&snapshot)).await {
                error!(mutation = %record.id, entity = %record.entity_id, error = %err, "failed to persist entity");
                return Err(err);
            }
        }

        let server_clock = {
            let mut clock = self.server_clock.lock();
            *clock = clock.merge(&record.clock);
            clock.clone()
        };

        self.archive(&record, &resolution).await;

        match (was_contested, version.pending_conflicts.is_empty()) {
            (false, false) => info!(entity = %version.entity_id, "entity contested"),
            (true, true) => info!(entity = %version.entity_id, "entity uncontested"),
            _ => {}
        }

        if !resolution.is_stale() {
            self.fan_out(&resolved);
        }

        debug!(
            mutation = %record.id,
            entity = %record.entity_id,
            outcome = resolution.label(),
            clock = %resolved.clock,
            "acknowledged mutation"
        );

        Ok(SubmitResponse::Ack(Ack {
            mutation_id: record.id,
            resolution,
            resolved,
            server_clock,
        }))
    }

    /// Snapshots of every entity the caller's known clocks do not cover
    pub async fn catch_up(&self, known: &BTreeMap<EntityId, VectorClock>) -> Result<CatchUp> {
        let versions = self.blocking(|store| store.list()).await?;

        let snapshots: Vec<MutationRecord> = versions
            .iter()
            .filter(|version| {
                known
                    .get(&version.entity_id)
                    .map_or(true, |clock| !clock.dominates(&version.current_clock))
            })
            .map(MutationRecord::snapshot)
            .collect();

        debug!(known = known.len(), snapshots = snapshots.len(), "catch-up");

        Ok(CatchUp {
            snapshots,
            server_clock: self.server_clock(),
        })
    }

    pub async fn read_model(&self, entity_id: &EntityId) -> Result<Option<EntityVersion>> {
        let entity_id = entity_id.clone();
        self.blocking(move |store| store.get(&entity_id)).await
    }

    pub async fn entities(&self) -> Result<Vec<EntityVersion>> {
        self.blocking(|store| store.list()).await
    }

    /// Entities with at least one pending conflict
    pub async fn contested(&self) -> Result<Vec<EntityVersion>> {
        let versions = self.entities().await?;
        Ok(versions
            .into_iter()
            .filter(|version| !version.pending_conflicts.is_empty())
            .collect())
    }

    pub async fn pending_conflicts(&self, entity_id: &EntityId) -> Result<Vec<PendingConflict>> {
        Ok(self
            .read_model(entity_id)
            .await?
            .map(|version| version.pending_conflicts)
            .unwrap_or_default())
    }

    /// Clear a conflict after a human reviewed it. The merged value stays.
    pub async fn acknowledge_conflict(
        &self,
        entity_id: &EntityId,
        conflict_id: ConflictId,
    ) -> Result<PendingConflict> {
        let _guard = self.lock_entity(entity_id).await;

        let id = entity_id.clone();
        let mut version = self
            .blocking(move |store| store.get(&id))
            .await?
            .ok_or_else(|| SyncError::UnknownEntity(entity_id.clone()))?;

        let conflict = version
            .acknowledge_conflict(conflict_id)
            .ok_or_else(|| SyncError::UnknownConflict {
                entity: entity_id.clone(),
                conflict: conflict_id,
            })?;

        // Acknowledging is a new entity state, so dashboards and catch-up see it.
        version.current_clock = version
            .current_clock
            .increment(&ActorId::from(COORDINATOR_ACTOR));
        let contested = !version.pending_conflicts.is_empty();
        let snapshot = version.clone();
        self.blocking(move |store| store.put(&snapshot)).await?;

        {
            let mut clock = self.server_clock.lock();
            *clock = clock.merge(&version.current_clock);
        }

        info!(
            entity = %entity_id,
            conflict = %conflict_id,
            field = %conflict.field,
            contested,
            "conflict acknowledged"
        );

        self.fan_out(&MutationRecord::snapshot(&version));
        Ok(conflict)
    }

    pub async fn history(&self, entity_id: &EntityId) -> Result<Vec<ArchivedMutation>> {
        let entity_id = entity_id.clone();
        self.blocking(move |store| store.history(&entity_id)).await
    }

    fn authorize(&self, record: &MutationRecord) -> std::result::Result<(), RejectReason> {
        let role = self
            .actors
            .read()
            .get(&record.actor_id)
            .map(|profile| profile.role)
            .ok_or_else(|| RejectReason::UnknownActor {
                actor: record.actor_id.clone(),
            })?;

        if !role.can_write() {
            return Err(RejectReason::PermissionDenied {
                message: format!("{:?} dashboards are read-only", role),
            });
        }

        match record.op {
            MutationOp::Tombstone | MutationOp::Restore if !role.can_delete() => {
                return Err(RejectReason::PermissionDenied {
                    message: "only administrators may delete or restore".to_string(),
                });
            }
            MutationOp::Snapshot => {
                return Err(RejectReason::InvalidMutation {
                    message: "snapshots cannot be submitted".to_string(),
                });
            }
            MutationOp::Upsert if record.touches(TOMBSTONE_FIELD) => {
                return Err(RejectReason::InvalidMutation {
                    message: format!("{} is reserved for delete and restore", TOMBSTONE_FIELD),
                });
            }
            _ => {}
        }

        if record.payload.is_empty() {
            return Err(RejectReason::InvalidMutation {
                message: "empty payload".to_string(),
            });
        }

        if record.clock.get(&record.actor_id) == 0 {
            return Err(RejectReason::InvalidMutation {
                message: format!("clock {} has no entry for {}", record.clock, record.actor_id),
            });
        }

        Ok(())
    }

    async fn lock_entity(&self, entity_id: &EntityId) -> EntityGuard<'_> {
        let lock = Arc::clone(self.entity_locks.lock().entry(entity_id.clone()).or_default());
        EntityGuard {
            locks: &self.entity_locks,
            entity_id: entity_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn entity_lock_count(&self) -> usize {
        self.entity_locks.lock().len()
    }

    async fn archive(&self, record: &MutationRecord, resolution: &Resolution) {
        if !self.config.archive {
            return;
        }

        let archived = record.clone();
        let outcome = ArchiveOutcome::from(resolution);
        if let Err(err) = self
            .blocking(move |store| store.archive(&archived, outcome))
            .await
        {
            warn!(mutation = %record.id, error = %err, "failed to archive mutation");
        }
    }

    fn fan_out(&self, record: &MutationRecord) {
        let mut closed = Vec::new();

        for (actor_id, tx) in self.subscribers.read().iter() {
            if !self.config.echo_to_origin && actor_id == &record.actor_id {
                continue;
            }
            if tx.send(record.clone()).is_err() {
                closed.push(actor_id.clone());
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            for actor_id in closed {
                debug!(actor = %actor_id, "dropping closed subscription");
                subscribers.remove(&actor_id);
            }
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&dyn CanonicalStore) -> std::result::Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| StoreError::Backend(format!("store task failed: {}", e)))?
            .map_err(SyncError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityKind, EntityState, LocalEdit};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::{assert_err, assert_ok};

    /// Store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl CanonicalStore for FlakyStore {
        fn get(&self, entity_id: &EntityId) -> std::result::Result<Option<EntityVersion>, StoreError> {
            self.inner.get(entity_id)
        }

        fn put(&self, version: &EntityVersion) -> std::result::Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.put(version)
        }

        fn list(&self) -> std::result::Result<Vec<EntityVersion>, StoreError> {
            self.inner.list()
        }

        fn archive(&self, record: &MutationRecord, outcome: ArchiveOutcome) -> std::result::Result<(), StoreError> {
            self.inner.archive(record, outcome)
        }

        fn history(&self, entity_id: &EntityId) -> std::result::Result<Vec<ArchivedMutation>, StoreError> {
            self.inner.history(entity_id)
        }
    }

    fn coordinator() -> SyncCoordinator {
        let coordinator = SyncCoordinator::in_memory(&SyncConfig::default());
        coordinator.register_actor(ActorProfile::worker("W"));
        coordinator.register_actor(ActorProfile::admin("A"));
        coordinator.register_actor(ActorProfile::client("C"));
        coordinator
    }

    fn record(actor: &str, clock: &[(&str, u64)], edit: LocalEdit) -> MutationRecord {
        let clock = VectorClock::of(clock);
        let seq = clock.get(&ActorId::from(actor));
        MutationRecord::new(ActorId::from(actor), seq, clock, edit)
    }

    fn status(value: &str) -> LocalEdit {
        LocalEdit::upsert("task-1", EntityKind::Task).set("status", value)
    }

    fn ack(response: SubmitResponse) -> Ack {
        match response {
            SubmitResponse::Ack(ack) => ack,
            SubmitResponse::Reject(reject) => panic!("unexpected reject: {:?}", reject),
        }
    }

    fn reject(response: SubmitResponse) -> RejectReason {
        match response {
            SubmitResponse::Reject(reject) => reject.reason,
            SubmitResponse::Ack(ack) => panic!("unexpected ack: {:?}", ack),
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_fans_out_to_others() {
        let coordinator = coordinator();
        let mut worker = coordinator.subscribe(ActorId::from("W"));
        let mut admin = coordinator.subscribe(ActorId::from("A"));

        let submitted = record("W", &[("W", 1)], status("done"));
        let ack = ack(coordinator.submit(submitted.clone()).await.unwrap());

        assert_eq!(ack.mutation_id, submitted.id);
        assert_eq!(ack.resolution, Resolution::FastForward);
        assert_eq!(ack.server_clock, VectorClock::of(&[("W", 1)]));

        let pushed = admin.recv().await.unwrap();
        assert_eq!(pushed.id, submitted.id);
        assert_eq!(pushed.payload["status"], json!("done"));
        assert!(worker.try_recv().is_none());

        let version = coordinator
            .read_model(&EntityId::from("task-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.current_clock, VectorClock::of(&[("W", 1)]));
    }

    #[tokio::test]
    async fn test_echo_to_origin() {
        let mut config = SyncConfig::default();
        config.coordinator.echo_to_origin = true;
        let coordinator = SyncCoordinator::in_memory(&config);
        coordinator.register_actor(ActorProfile::worker("W"));
        let mut worker = coordinator.subscribe(ActorId::from("W"));

        assert_ok!(coordinator.submit(record("W", &[("W", 1)], status("done"))).await);
        assert!(worker.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_rejects_by_role_and_shape() {
        let coordinator = coordinator();

        let unknown = record("X", &[("X", 1)], status("done"));
        assert!(matches!(
            reject(coordinator.submit(unknown).await.unwrap()),
            RejectReason::UnknownActor { .. }
        ));

        let client = record("C", &[("C", 1)], status("done"));
        assert!(matches!(
            reject(coordinator.submit(client).await.unwrap()),
            RejectReason::PermissionDenied { .. }
        ));

        let delete = record("W", &[("W", 1)], LocalEdit::tombstone("task-1", EntityKind::Task));
        assert!(matches!(
            reject(coordinator.submit(delete).await.unwrap()),
            RejectReason::PermissionDenied { .. }
        ));

        let empty = record("W", &[("W", 1)], LocalEdit::upsert("task-1", EntityKind::Task));
        assert!(matches!(
            reject(coordinator.submit(empty).await.unwrap()),
            RejectReason::InvalidMutation { .. }
        ));

        let foreign_clock = record("W", &[("A", 1)], status("done"));
        assert!(matches!(
            reject(coordinator.submit(foreign_clock).await.unwrap()),
            RejectReason::InvalidMutation { .. }
        ));

        let reserved = record("W", &[("W", 1)], status("done").set(TOMBSTONE_FIELD, true));
        assert!(matches!(
            reject(coordinator.submit(reserved).await.unwrap()),
            RejectReason::InvalidMutation { .. }
        ));

        assert!(coordinator.entities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_kind_mismatch() {
        let coordinator = coordinator();
        assert_ok!(coordinator.submit(record("W", &[("W", 1)], status("done"))).await);

        let wrong = record(
            "A",
            &[("A", 1)],
            LocalEdit::upsert("task-1", EntityKind::Building).set("address", "1 Main St"),
        );
        assert!(matches!(
            reject(coordinator.submit(wrong).await.unwrap()),
            RejectReason::InvalidMutation { .. }
        ));
    }

    #[tokio::test]
    async fn test_redelivery_is_acked_as_stale_without_broadcast() {
        let coordinator = coordinator();
        let mut admin = coordinator.subscribe(ActorId::from("A"));

        let submitted = record("W", &[("W", 1)], status("done"));
        coordinator.submit(submitted.clone()).await.unwrap();
        assert!(admin.try_recv().is_some());

        let again = ack(coordinator.submit(submitted).await.unwrap());
        assert_eq!(again.resolution, Resolution::Stale);
        assert_eq!(again.resolved.payload["status"], json!("done"));
        assert!(admin.try_recv().is_none());

        let history = coordinator.history(&EntityId::from("task-1")).await.unwrap();
        let outcomes: Vec<_> = history.iter().map(|entry| entry.outcome).collect();
        assert_eq!(outcomes, vec![ArchiveOutcome::FastForward, ArchiveOutcome::Stale]);
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_no_trace() {
        let store = Arc::new(FlakyStore::default());
        let coordinator = SyncCoordinator::new(store.clone(), &SyncConfig::default());
        coordinator.register_actor(ActorProfile::worker("W"));
        coordinator.register_actor(ActorProfile::admin("A"));
        let mut admin = coordinator.subscribe(ActorId::from("A"));

        store.failing.store(true, Ordering::SeqCst);
        let submitted = record("W", &[("W", 1)], status("done"));
        let result = coordinator.submit(submitted.clone()).await;

        assert!(matches!(assert_err!(result), SyncError::Persistence(_)));
        assert!(coordinator.server_clock().is_empty());
        assert!(store.inner.is_empty());
        assert!(admin.try_recv().is_none());

        store.failing.store(false, Ordering::SeqCst);
        let ack = ack(coordinator.submit(submitted).await.unwrap());
        assert_eq!(ack.resolution, Resolution::FastForward);
        assert!(admin.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_catch_up_returns_unseen_entities() {
        let coordinator = coordinator();
        coordinator.submit(record("W", &[("W", 1)], status("done"))).await.unwrap();
        coordinator
            .submit(record(
                "A",
                &[("A", 1)],
                LocalEdit::upsert("building-7", EntityKind::Building).set("address", "1 Main St"),
            ))
            .await
            .unwrap();

        let everything = coordinator.catch_up(&BTreeMap::new()).await.unwrap();
        assert_eq!(everything.snapshots.len(), 2);
        assert_eq!(everything.server_clock, VectorClock::of(&[("W", 1), ("A", 1)]));

        let known = BTreeMap::from([(EntityId::from("task-1"), VectorClock::of(&[("W", 1)]))]);
        let missing = coordinator.catch_up(&known).await.unwrap();
        assert_eq!(missing.snapshots.len(), 1);
        assert_eq!(missing.snapshots[0].entity_id, EntityId::from("building-7"));
        assert_eq!(missing.snapshots[0].op, MutationOp::Snapshot);
    }

    #[tokio::test]
    async fn test_acknowledge_conflict() {
        let coordinator = coordinator();
        let mut client = coordinator.subscribe(ActorId::from("C"));
        coordinator.submit(record("W", &[("W", 1)], status("done"))).await.unwrap();
        let merged = ack(coordinator.submit(record("A", &[("A", 1)], status("cancelled"))).await.unwrap());

        // Resolved records tell dashboards the entity is contested.
        assert_eq!(merged.resolved.open_conflicts.len(), 1);
        assert_eq!(merged.resolved.open_conflicts[0].field, "status");
        assert!(client.recv().await.unwrap().open_conflicts.is_empty());
        assert_eq!(client.recv().await.unwrap().open_conflicts.len(), 1);

        let task = EntityId::from("task-1");
        let conflicts = coordinator.pending_conflicts(&task).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(coordinator.contested().await.unwrap().len(), 1);

        let cleared = coordinator
            .acknowledge_conflict(&task, conflicts[0].id)
            .await
            .unwrap();
        assert_eq!(cleared.field, "status");

        let version = coordinator.read_model(&task).await.unwrap().unwrap();
        assert_eq!(version.state(), EntityState::Uncontested);
        assert_eq!(
            version.current_clock,
            VectorClock::of(&[("W", 1), ("A", 1), (COORDINATOR_ACTOR, 1)])
        );
        assert_eq!(coordinator.server_clock(), version.current_clock);

        // The cleared state is pushed as a newer snapshot.
        let pushed = client.recv().await.unwrap();
        assert_eq!(pushed.op, MutationOp::Snapshot);
        assert_eq!(pushed.clock, version.current_clock);
        assert!(pushed.open_conflicts.is_empty());

        let again = coordinator.acknowledge_conflict(&task, conflicts[0].id).await;
        assert!(matches!(again, Err(SyncError::UnknownConflict { .. })));

        let missing = coordinator
            .acknowledge_conflict(&EntityId::from("nope"), conflicts[0].id)
            .await;
        assert!(matches!(missing, Err(SyncError::UnknownEntity(_))));
    }

    #[tokio::test]
    async fn test_parallel_entities() {
        let coordinator = Arc::new(coordinator());

        let submissions = (0..16).map(|i| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let edit = LocalEdit::upsert(format!("task-{}", i), EntityKind::Task).set("status", "open");
                coordinator.submit(record("W", &[("W", i + 1)], edit)).await
            }
        });

        let responses = futures::future::join_all(submissions).await;
        assert!(responses.iter().all(|r| matches!(r, Ok(SubmitResponse::Ack(_)))));
        assert_eq!(coordinator.entities().await.unwrap().len(), 16);
        assert_eq!(coordinator.server_clock(), VectorClock::of(&[("W", 16)]));
    }

    #[tokio::test]
    async fn test_entity_locks_are_released() {
        let coordinator = Arc::new(coordinator());

        let submissions = (1..=8).map(|seq| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                coordinator
                    .submit(record("W", &[("W", seq)], status("open")))
                    .await
            }
        });
        for response in futures::future::join_all(submissions).await {
            assert_ok!(response);
        }
        coordinator
            .submit(record("W", &[("W", 9)], LocalEdit::upsert("building-1", EntityKind::Building).set("floors", 3)))
            .await
            .unwrap();

        assert_eq!(coordinator.entity_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_server_clock() {
        let store: Arc<dyn CanonicalStore> = Arc::new(MemoryStore::new());
        let first = SyncCoordinator::new(Arc::clone(&store), &SyncConfig::default());
        first.register_actor(ActorProfile::worker("W"));
        first.submit(record("W", &[("W", 3)], status("done"))).await.unwrap();

        let second = SyncCoordinator::new(store, &SyncConfig::default());
        let clock = second.restore_server_clock().await.unwrap();
        assert_eq!(clock, VectorClock::of(&[("W", 3)]));
    }
}
