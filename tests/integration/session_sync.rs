//! Cross-context convergence over the store-change and direct paths.

use super::test_utils::{geometry, moved_geometry, Harness};
use tabsync::channel::{Envelope, Payload};
use tabsync::events::{DiagnosticEvent, EngineEvent};
use tabsync::runtime::{NoticeOutcome, OpOutcome};
use tabsync::sharedstore::SharedStore;
use tabsync::types::{Revision, Visibility};

#[tokio::test]
async fn test_store_notice_path_converges() {
    let harness = Harness::new();
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;
    let mut notices = harness.store.subscribe();

    let id = match writer.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    writer.flush_now().await.unwrap();

    let notice = notices.recv().await.unwrap();
    let outcome = reader.handle_notice(notice).await.unwrap();
    assert_eq!(outcome, NoticeOutcome::Reconciled { applied: 1, removed: 0 });

    let replica = reader.entity(&id).unwrap();
    assert_eq!(replica.geometry, geometry());
    assert_eq!(replica.owner_context_id, writer.context_id().unwrap());
}

#[tokio::test]
async fn test_self_write_echo_is_ignored() {
    let harness = Harness::new();
    let writer = harness.online_runtime().await;
    let mut notices = harness.store.subscribe();

    writer.create_entity(geometry()).await.unwrap();
    writer.flush_now().await.unwrap();

    let notice = notices.recv().await.unwrap();
    let outcome = writer.handle_notice(notice).await.unwrap();
    assert_eq!(outcome, NoticeOutcome::SelfWrite);
}

#[tokio::test]
async fn test_redelivered_notice_deduplicated_by_content() {
    let harness = Harness::new();
    harness.store.set_redeliver(true);
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;
    let mut notices = harness.store.subscribe();

    writer.create_entity(geometry()).await.unwrap();
    writer.flush_now().await.unwrap();

    let first = notices.recv().await.unwrap();
    let second = notices.recv().await.unwrap();
    assert_eq!(first, second);

    assert!(matches!(
        reader.handle_notice(first).await.unwrap(),
        NoticeOutcome::Reconciled { applied: 1, .. }
    ));
    assert_eq!(
        reader.handle_notice(second).await.unwrap(),
        NoticeOutcome::DuplicateContent
    );
}

#[tokio::test]
async fn test_delayed_notice_still_applies() {
    let harness = Harness::new();
    harness.store.set_notice_latency(std::time::Duration::from_millis(60));
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;
    let mut notices = harness.store.subscribe();

    writer.create_entity(geometry()).await.unwrap();
    writer.flush_now().await.unwrap();

    // The notice lands well after the write; the reader still converges.
    let notice = notices.recv().await.unwrap();
    assert!(matches!(
        reader.handle_notice(notice).await.unwrap(),
        NoticeOutcome::Reconciled { applied: 1, .. }
    ));
}

#[tokio::test]
async fn test_direct_update_applies_next_revision() {
    let harness = Harness::new();
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;

    let mut entity = match writer.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(entity.revision, Revision(1));

    reader
        .handle_direct(Envelope::new(Payload::EntityUpdate {
            entity: entity.clone(),
        }))
        .await
        .unwrap();
    assert_eq!(reader.entity(&entity.id).unwrap().revision, Revision(1));

    // Next revision applies, same revision is a harmless duplicate, older is
    // discarded.
    entity.revision = Revision(2);
    entity.geometry = moved_geometry();
    reader
        .handle_direct(Envelope::new(Payload::EntityUpdate {
            entity: entity.clone(),
        }))
        .await
        .unwrap();
    let replica = reader.entity(&entity.id).unwrap();
    assert_eq!(replica.revision, Revision(2));
    assert_eq!(replica.geometry, moved_geometry());

    entity.revision = Revision(1);
    entity.geometry = geometry();
    reader
        .handle_direct(Envelope::new(Payload::EntityUpdate { entity: entity.clone() }))
        .await
        .unwrap();
    assert_eq!(reader.entity(&entity.id).unwrap().revision, Revision(2));
}

#[tokio::test]
async fn test_revision_gap_triggers_full_resync() {
    let harness = Harness::new();
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;

    let id = match writer.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    writer.minimize(&id).await.unwrap();
    writer.restore(&id).await.unwrap();
    let entity = writer.entity(&id).unwrap();
    assert_eq!(entity.revision, Revision(3));
    writer.flush_now().await.unwrap();

    // The reader never saw revisions 1 and 2; the gap must pull full state
    // instead of buffering or applying blindly.
    let events = reader.events().subscribe();
    reader
        .handle_direct(Envelope::new(Payload::EntityUpdate { entity }))
        .await
        .unwrap();

    let replica = reader.entity(&id).unwrap();
    assert_eq!(replica.revision, Revision(3));
    assert_eq!(replica.visibility, Visibility::Visible);
    let mut resynced = false;
    while let Ok(envelope) = events.try_recv() {
        if matches!(
            envelope.event,
            EngineEvent::Diagnostic(DiagnosticEvent::ResyncTriggered { .. })
        ) {
            resynced = true;
        }
    }
    assert!(resynced);
}

#[tokio::test]
async fn test_minimized_state_survives_cross_context_round_trip() {
    let harness = Harness::new();
    let writer = harness.online_runtime().await;
    let reader = harness.online_runtime().await;

    let id = match writer.create_entity(geometry()).await.unwrap() {
        OpOutcome::Applied(entity) => entity.id,
        other => panic!("unexpected outcome: {:?}", other),
    };
    writer.minimize(&id).await.unwrap();
    writer.flush_now().await.unwrap();

    reader.resync().await.unwrap();
    let replica = reader.entity(&id).unwrap();
    assert_eq!(replica.visibility, Visibility::Minimized);
    // The replica is foreign; the reader holds no snapshot for it.
    assert!(!reader.snapshot_exists(&id));
}
