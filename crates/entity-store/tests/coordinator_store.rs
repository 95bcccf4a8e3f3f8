use entity_store::EntityDb;
use serde_json::json;
use std::sync::Arc;
use sync_engine::{
    ActorId, ActorProfile, ArchiveOutcome, CanonicalStore, EntityId, EntityKind, LocalEdit,
    MutationRecord, Resolution, SubmitResponse, SyncConfig, SyncCoordinator, VectorClock,
};

fn record(actor: &str, clock: &[(&str, u64)], field: &str, value: &str) -> MutationRecord {
    let clock = VectorClock::of(clock);
    let seq = clock.get(&ActorId::from(actor));
    MutationRecord::new(
        ActorId::from(actor),
        seq,
        clock,
        LocalEdit::upsert("task-1", EntityKind::Task).set(field, value),
    )
}

fn coordinator(db: Arc<EntityDb>) -> SyncCoordinator {
    let coordinator = SyncCoordinator::new(db, &SyncConfig::default());
    coordinator.register_actor(ActorProfile::worker("W"));
    coordinator.register_actor(ActorProfile::admin("A"));
    coordinator
}

#[tokio::test]
async fn test_conflict_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("entities.db");

    {
        let db = Arc::new(EntityDb::open_or_create(&path).unwrap());
        let coordinator = coordinator(Arc::clone(&db));

        coordinator
            .submit(record("W", &[("W", 1)], "status", "done"))
            .await
            .unwrap();
        let response = coordinator
            .submit(record("A", &[("A", 1)], "status", "cancelled"))
            .await
            .unwrap();

        match response {
            SubmitResponse::Ack(ack) => {
                assert!(matches!(ack.resolution, Resolution::Merged { ref conflicts } if conflicts.len() == 1));
            }
            SubmitResponse::Reject(reject) => panic!("unexpected reject: {}", reject.reason),
        }
    }

    let db = Arc::new(EntityDb::open_or_create(&path).unwrap());
    let coordinator = coordinator(Arc::clone(&db));

    let clock = coordinator.restore_server_clock().await.unwrap();
    assert_eq!(clock, VectorClock::of(&[("W", 1), ("A", 1)]));

    let contested = coordinator.contested().await.unwrap();
    assert_eq!(contested.len(), 1);
    assert_eq!(db.contested_ids().unwrap(), vec![EntityId::from("task-1")]);

    let conflict = contested[0].pending_conflicts[0].clone();
    coordinator
        .acknowledge_conflict(&EntityId::from("task-1"), conflict.id)
        .await
        .unwrap();
    assert!(db.contested_ids().unwrap().is_empty());
}

#[tokio::test]
async fn test_archive_records_every_outcome() {
    let db = Arc::new(EntityDb::open_in_memory().unwrap());
    let coordinator = coordinator(Arc::clone(&db));

    let first = record("W", &[("W", 1)], "status", "open");
    coordinator.submit(first.clone()).await.unwrap();
    coordinator
        .submit(record("W", &[("W", 2)], "status", "done"))
        .await
        .unwrap();
    coordinator.submit(first).await.unwrap();
    coordinator
        .submit(record("A", &[("A", 1)], "priority", "high"))
        .await
        .unwrap();

    let history = coordinator.history(&EntityId::from("task-1")).await.unwrap();
    let outcomes: Vec<ArchiveOutcome> = history.iter().map(|entry| entry.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            ArchiveOutcome::FastForward,
            ArchiveOutcome::FastForward,
            ArchiveOutcome::Stale,
            ArchiveOutcome::Merged,
        ]
    );

    let version = CanonicalStore::get(db.as_ref(), &EntityId::from("task-1"))
        .unwrap()
        .unwrap();
    assert_eq!(version.field("status"), Some(&json!("done")));
    assert_eq!(version.field("priority"), Some(&json!("high")));
    assert!(version.pending_conflicts.is_empty());
}
