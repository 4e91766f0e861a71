//! Ownership isolation across contexts.

use super::test_utils::{geometry, moved_geometry, Harness};
use tabsync::channel::{Envelope, Payload};
use tabsync::error::SyncError;
use tabsync::events::{DiagnosticEvent, EngineEvent};
use tabsync::runtime::OpOutcome;
use tabsync::sharedstore::SharedStore;
use tabsync::types::EntityId;

async fn create_and_propagate(
    harness: &Harness,
) -> (
    std::sync::Arc<tabsync::runtime::ContextRuntime>,
    std::sync::Arc<tabsync::runtime::ContextRuntime>,
    EntityId,
) {
    let owner = harness.online_runtime().await;
    let observer = harness.online_runtime().await;

    let id = match owner.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    owner.flush_now().await.unwrap();
    observer.resync().await.unwrap();
    assert!(observer.entity(&id).is_some(), "replica must propagate");
    (owner, observer, id)
}

#[tokio::test]
async fn test_foreign_replica_cannot_be_mutated() {
    let harness = Harness::new();
    let (_owner, observer, id) = create_and_propagate(&harness).await;

    let err = observer.minimize(&id).await.unwrap_err();
    assert!(matches!(err, SyncError::OwnershipViolation { .. }));

    let err = observer.destroy(&id).await.unwrap_err();
    assert!(matches!(err, SyncError::OwnershipViolation { .. }));

    // Replica untouched by the rejected mutations.
    let replica = observer.entity(&id).unwrap();
    assert_eq!(replica.geometry, geometry());
}

#[tokio::test]
async fn test_spurious_geometry_end_for_foreign_window_rejected() {
    let harness = Harness::new();
    let (owner, observer, id) = create_and_propagate(&harness).await;
    let owner_ctx = owner.context_id().unwrap();

    let events = observer.events().subscribe();
    let envelope = Envelope::new(Payload::GeometryChangeEnd {
        id: id.clone(),
        geometry: moved_geometry(),
        actor: owner_ctx,
    });
    let err = observer.handle_direct(envelope).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::OwnershipViolation { .. } | SyncError::StaleCallback { .. }
    ));

    // Rejected loudly: a diagnostic is emitted, state is unchanged.
    let mut saw_diagnostic = false;
    while let Ok(envelope) = events.try_recv() {
        if matches!(envelope.event, EngineEvent::Diagnostic(_)) {
            saw_diagnostic = true;
        }
    }
    assert!(saw_diagnostic);
    assert_eq!(observer.entity(&id).unwrap().geometry, geometry());
}

#[tokio::test]
async fn test_owner_removal_prunes_replicas() {
    let harness = Harness::new();
    let (owner, observer, id) = create_and_propagate(&harness).await;

    let events = observer.events().subscribe();
    owner.destroy(&id).await.unwrap();
    owner.flush_now().await.unwrap();
    observer.resync().await.unwrap();

    assert!(observer.entity(&id).is_none());
    // The record now carries the intentional-empty marker for the owner's
    // emptied set, and the observer announces the removal.
    let record = harness.store.read().await.unwrap();
    assert!(record.intentional_empty);
    assert!(!record.contains(&id));
    let mut removed = false;
    while let Ok(envelope) = events.try_recv() {
        if matches!(envelope.event, EngineEvent::EntityDestroyed { .. }) {
            removed = true;
        }
    }
    assert!(removed);
}

#[tokio::test]
async fn test_panel_feed_filters_foreign_entities() {
    let harness = Harness::new();
    let owner = harness.online_runtime().await;
    let other_ctx = tabsync::types::ContextId(999);

    let panel = owner.events().subscribe_owner(owner.context_id().unwrap());
    let foreign_panel = owner.events().subscribe_owner(other_ctx);

    owner.create_entity(geometry()).await.unwrap();

    assert!(panel.try_recv().is_ok(), "own entity event delivered");
    let mut leaked = false;
    while let Ok(envelope) = foreign_panel.try_recv() {
        if matches!(envelope.event, EngineEvent::EntityChanged { .. }) {
            leaked = true;
        }
    }
    assert!(!leaked, "foreign panel must never see this owner's entities");
}

#[tokio::test]
async fn test_record_owner_mismatch_rejected_with_diagnostic() {
    let harness = Harness::new();
    let (_owner, observer, id) = create_and_propagate(&harness).await;

    // Forge a record claiming the same entity under a different owner.
    let mut record = harness.store.read().await.unwrap();
    for entity in &mut record.entities {
        if entity.id == id {
            entity.owner_context_id = tabsync::types::ContextId(777);
            entity.revision = tabsync::types::Revision(50);
        }
    }
    let base = record.revision;
    record.revision += 1;
    record.write_id = "w-forged".to_string();
    harness.store.compare_and_put(base, record).await.unwrap();

    let events = observer.events().subscribe();
    observer.resync().await.unwrap();

    // Original owner retained locally.
    let replica = observer.entity(&id).unwrap();
    assert_ne!(replica.owner_context_id, tabsync::types::ContextId(777));
    let mut saw_violation = false;
    while let Ok(envelope) = events.try_recv() {
        if matches!(
            envelope.event,
            EngineEvent::Diagnostic(DiagnosticEvent::OwnershipViolation { .. })
        ) {
            saw_violation = true;
        }
    }
    assert!(saw_violation);
}
