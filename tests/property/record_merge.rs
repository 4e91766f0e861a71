//! Property-based tests for owner-scoped record merging.

use proptest::prelude::*;
use tabsync::entity::Entity;
use tabsync::persist::record::PersistedRecord;
use tabsync::types::{ContextId, EntityId, Geometry, PartitionId, Revision, Visibility};

fn arb_entity(owner_range: std::ops::Range<u32>) -> impl Strategy<Value = Entity> {
    (
        owner_range,
        1u64..100,
        1u64..50,
        -2000i32..2000,
        -2000i32..2000,
        1u32..3000,
        1u32..3000,
        any::<bool>(),
    )
        .prop_map(|(owner, counter, rev, x, y, w, h, minimized)| Entity {
            id: EntityId::new(ContextId(owner), counter),
            owner_context_id: ContextId(owner),
            owner_partition_id: PartitionId(0),
            visibility: if minimized {
                Visibility::Minimized
            } else {
                Visibility::Visible
            },
            geometry: Geometry::new(x, y, w, h),
            revision: Revision(rev),
        })
}

fn dedup_by_id(mut entities: Vec<Entity>) -> Vec<Entity> {
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    entities.dedup_by(|a, b| a.id == b.id);
    entities
}

/// Owner-scoped merge never drops a foreign entity, no matter what the
/// writer's own set looks like.
#[test]
fn test_merge_preserves_foreign_entities_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                proptest::collection::vec(arb_entity(2u32..6), 0..12),
                proptest::collection::vec(arb_entity(1u32..2), 0..8),
                0u64..1000,
            ),
            |(foreign, owned, base_revision)| {
                let foreign = dedup_by_id(foreign);
                let owned = dedup_by_id(owned);
                let stored = PersistedRecord {
                    entities: foreign.clone(),
                    revision: base_revision,
                    ..PersistedRecord::default()
                };

                let merged = stored.merge_owned(
                    ContextId(1),
                    owned.clone(),
                    "w-test".to_string(),
                    owned.is_empty(),
                );

                for entity in &foreign {
                    assert!(
                        merged.contains(&entity.id),
                        "foreign entity {} dropped by merge",
                        entity.id
                    );
                }
                for entity in &owned {
                    assert!(merged.contains(&entity.id));
                }
                assert_eq!(merged.revision, base_revision + 1);
                Ok(())
            },
        )
        .unwrap();
}

/// Merging is idempotent on the writer's slice: writing the same owned set
/// twice yields the same entity content (only record metadata advances).
#[test]
fn test_merge_idempotent_on_owned_slice_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                proptest::collection::vec(arb_entity(2u32..5), 0..8),
                proptest::collection::vec(arb_entity(1u32..2), 1..8),
            ),
            |(foreign, owned)| {
                let foreign = dedup_by_id(foreign);
                let owned = dedup_by_id(owned);
                let stored = PersistedRecord {
                    entities: foreign,
                    revision: 3,
                    ..PersistedRecord::default()
                };

                let once = stored.merge_owned(ContextId(1), owned.clone(), "w1".into(), false);
                let twice = once.merge_owned(ContextId(1), owned, "w2".into(), false);
                assert_eq!(once.entities, twice.entities);
                Ok(())
            },
        )
        .unwrap();
}

/// Content fingerprints ignore entity ordering and the write id, and track
/// every content change.
#[test]
fn test_fingerprint_content_addressing_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &proptest::collection::vec(arb_entity(1u32..5), 1..10),
            |entities| {
                let entities = dedup_by_id(entities);
                let a = PersistedRecord {
                    entities: entities.clone(),
                    write_id: "wa".to_string(),
                    revision: 5,
                    ..PersistedRecord::default()
                };
                let mut reversed = entities.clone();
                reversed.reverse();
                let b = PersistedRecord {
                    entities: reversed,
                    write_id: "wb".to_string(),
                    revision: 5,
                    ..PersistedRecord::default()
                };
                assert_eq!(a.fingerprint(), b.fingerprint());

                let mut mutated = a.clone();
                mutated.entities[0].revision =
                    Revision(mutated.entities[0].revision.as_u64() + 1);
                prop_assume!(a.entities != mutated.entities);
                assert_ne!(a.fingerprint(), mutated.fingerprint());
                Ok(())
            },
        )
        .unwrap();
}

/// The serialized record round-trips through JSON without losing entities or
/// unknown fields.
#[test]
fn test_record_json_round_trip_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(
                proptest::collection::vec(arb_entity(1u32..6), 0..10),
                0u64..10_000,
            ),
            |(entities, revision)| {
                let mut record = PersistedRecord {
                    entities: dedup_by_id(entities),
                    write_id: "w-prop".to_string(),
                    revision,
                    ..PersistedRecord::default()
                };
                record
                    .extra
                    .insert("futureField".to_string(), serde_json::json!(42));

                let bytes = record.to_json_bytes().unwrap();
                let back = PersistedRecord::from_json_bytes(&bytes).unwrap();
                assert_eq!(record, back);
                Ok(())
            },
        )
        .unwrap();
}
