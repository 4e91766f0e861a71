//! Transient snapshot store: geometry captured at minimize time.
//!
//! A snapshot exists exactly while its entity is `Minimized`. The coupling
//! invariant is checked by `audit`, which repairs the two corruption shapes
//! the engine can self-heal: a snapshot lingering for a `Visible` entity is
//! dropped, and a `Minimized` entity missing its snapshot gets one
//! reconstructed from the entity's last-known geometry. Healing never flips
//! visibility, since visibility is what consumers have already observed.

use crate::entity::EntityStore;
use crate::types::{now_millis, EntityId, Geometry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Saved geometry for one minimized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_id: EntityId,
    pub geometry: Geometry,
    pub taken_at_ms: u64,
}

/// Repairs performed by a coupling audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouplingRepair {
    /// Snapshot existed for a `Visible` entity; dropped.
    DroppedStale(EntityId),
    /// `Minimized` entity had no snapshot; reconstructed from entity state.
    Reconstructed(EntityId),
}

/// In-memory snapshot store for one context.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<EntityId, Snapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&mut self, entity_id: EntityId, geometry: Geometry) {
        let snapshot = Snapshot {
            entity_id: entity_id.clone(),
            geometry,
            taken_at_ms: now_millis(),
        };
        self.snapshots.insert(entity_id, snapshot);
    }

    pub fn peek(&self, id: &EntityId) -> Option<&Snapshot> {
        self.snapshots.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Snapshot> {
        self.snapshots.remove(id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Check the snapshot/visibility coupling invariant against the entity
    /// store and repair violations. Returns the repairs performed.
    ///
    /// Only owned entities are audited: snapshots are captured by the owning
    /// context, so foreign minimized replicas never carry a local snapshot.
    /// `in_restore_grace` exempts just-restored entities, whose snapshot
    /// legitimately outlives the flip to `Visible` until the grace window
    /// elapses.
    pub fn audit<F>(&mut self, entities: &EntityStore, in_restore_grace: F) -> Vec<CouplingRepair>
    where
        F: Fn(&EntityId) -> bool,
    {
        use crate::types::Visibility;

        let mut repairs = Vec::new();

        let stale: Vec<EntityId> = self
            .snapshots
            .keys()
            .filter(|id| {
                !in_restore_grace(id)
                    && (!entities.is_owned(id)
                        || entities
                            .get(id)
                            .map(|e| e.visibility == Visibility::Visible)
                            .unwrap_or(true))
            })
            .cloned()
            .collect();
        for id in stale {
            self.snapshots.remove(&id);
            repairs.push(CouplingRepair::DroppedStale(id));
        }

        for entity in entities.owned() {
            if entity.visibility == Visibility::Minimized && !self.contains(&entity.id) {
                self.capture(entity.id.clone(), entity.geometry);
                repairs.push(CouplingRepair::Reconstructed(entity.id.clone()));
            }
        }

        repairs
    }
}
