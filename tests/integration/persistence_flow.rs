//! Persistence behavior at the runtime level: debounce, merge, conflict
//! handling, and durability through a sled-backed store.

use super::test_utils::{fast_config, geometry, Harness};
use async_trait::async_trait;
use std::sync::Arc;
use tabsync::coordinator::Coordinator;
use tabsync::error::{StoreError, SyncError};
use tabsync::events::{DiagnosticEvent, EngineEvent, EventBus};
use tabsync::persist::record::PersistedRecord;
use tabsync::runtime::{ContextRuntime, OpOutcome};
use tabsync::sharedstore::{MemorySharedStore, SharedStore, SledSharedStore, StoreNotice};
use tabsync::types::PartitionId;
use tokio::sync::broadcast;

#[tokio::test]
async fn test_flush_without_pending_changes_is_noop() {
    let harness = Harness::new();
    let runtime = harness.online_runtime().await;
    assert_eq!(runtime.flush_now().await.unwrap(), None);
}

#[tokio::test]
async fn test_rapid_mutations_coalesce_into_one_write() {
    let harness = Harness::new();
    let runtime = harness.online_runtime().await;

    let id = match runtime.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    runtime.minimize(&id).await.unwrap();
    runtime.restore(&id).await.unwrap();

    // Three mutations, one flush, one record revision.
    runtime.flush_now().await.unwrap().expect("pending write");
    let record = harness.store.read().await.unwrap();
    assert_eq!(record.revision, 1);
    assert_eq!(record.entities.len(), 1);
    assert_eq!(runtime.flush_now().await.unwrap(), None);
}

#[tokio::test]
async fn test_two_writers_never_clobber_each_other() {
    let harness = Harness::new();
    let first = harness.online_runtime().await;
    let second = harness.online_runtime().await;

    let id_a = match first.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    let id_b = match second.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    first.flush_now().await.unwrap();
    second.flush_now().await.unwrap();

    let record = harness.store.read().await.unwrap();
    assert_eq!(record.revision, 2);
    assert!(record.contains(&id_a));
    assert!(record.contains(&id_b));
}

/// Store whose writes always fail the revision check, modeling a base
/// revision that keeps moving underneath the writer.
struct ContendedStore {
    inner: MemorySharedStore,
}

#[async_trait]
impl SharedStore for ContendedStore {
    async fn read(&self) -> Result<PersistedRecord, StoreError> {
        self.inner.read().await
    }

    async fn compare_and_put(
        &self,
        expected_revision: u64,
        _record: PersistedRecord,
    ) -> Result<(), StoreError> {
        Err(StoreError::RevisionMismatch {
            expected: expected_revision,
            actual: expected_revision + 1,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreNotice> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_exhausted_conflict_budget_flags_pending_persistence() {
    let cfg = fast_config();
    let coordinator = Coordinator::new(PartitionId(0));
    let store: Arc<dyn SharedStore> = Arc::new(ContendedStore {
        inner: MemorySharedStore::new(),
    });
    let runtime = ContextRuntime::new(
        cfg.clone(),
        store,
        coordinator.client(cfg),
        EventBus::new(),
    )
    .unwrap();
    runtime.init().await.unwrap();

    let id = match runtime.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };

    let events = runtime.events().subscribe();
    let err = runtime.flush_now().await.unwrap_err();
    assert!(matches!(err, SyncError::PersistenceConflict { .. }));

    // Local state stays applied but flagged, and the write remains pending
    // for retry.
    assert!(runtime.entity(&id).is_some());
    let mut flagged = false;
    while let Ok(envelope) = events.try_recv() {
        if matches!(
            envelope.event,
            EngineEvent::Diagnostic(DiagnosticEvent::PersistencePending { .. })
        ) {
            flagged = true;
        }
    }
    assert!(flagged);
    assert!(runtime.flush_now().await.is_err(), "write stays pending");
}

#[tokio::test]
async fn test_sled_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = fast_config();
    let coordinator = Coordinator::new(PartitionId(0));

    let id = {
        let store: Arc<dyn SharedStore> =
            Arc::new(SledSharedStore::new(dir.path()).unwrap());
        let runtime = ContextRuntime::new(
            cfg.clone(),
            store,
            coordinator.client(cfg.clone()),
            EventBus::new(),
        )
        .unwrap();
        runtime.init().await.unwrap();
        let id = match runtime.create_entity(geometry()).await.unwrap() {
            OpOutcome::Applied(entity) => entity.id,
            other => panic!("unexpected outcome: {:?}", other),
        };
        runtime.flush_now().await.unwrap();
        id
    };

    let reopened = SledSharedStore::new(dir.path()).unwrap();
    let record = reopened.read().await.unwrap();
    assert_eq!(record.revision, 1);
    assert!(record.contains(&id));
}

#[tokio::test]
async fn test_unknown_record_fields_survive_engine_writes() {
    let harness = Harness::new();

    // A newer client version wrote a field this version does not know.
    let mut seeded = PersistedRecord::default();
    seeded.revision = 1;
    seeded.write_id = "w-newer-version".to_string();
    seeded.extra.insert(
        "layoutHints".to_string(),
        serde_json::json!({"grid": true}),
    );
    harness.store.compare_and_put(0, seeded).await.unwrap();

    let runtime = harness.online_runtime().await;
    runtime.create_entity(geometry()).await.unwrap();
    runtime.flush_now().await.unwrap();

    let record = harness.store.read().await.unwrap();
    assert_eq!(record.revision, 2);
    assert_eq!(record.extra["layoutHints"]["grid"], true);
}
