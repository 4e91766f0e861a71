//! Entity model and per-context Entity Store.
//!
//! Each context holds its own `EntityStore` instance, constructed explicitly
//! and passed to the components that need it. The store is the single local
//! source of truth for "is this entity minimized, where is it, who owns it".
//! Entities owned by other contexts are held as read-only replicas; local
//! mutation of a foreign entity is an ownership violation, never applied.

use crate::error::SyncError;
use crate::types::{ContextId, EntityId, Geometry, PartitionId, Revision, Visibility};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One floating mini-window's logical state.
///
/// Serialized field names match the shared-store record layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    /// Context that created the entity. Never reassigned; adoption is out of
    /// scope and incoming owner changes are rejected.
    pub owner_context_id: ContextId,
    pub owner_partition_id: PartitionId,
    pub visibility: Visibility,
    /// Authoritative only while `Visible`.
    pub geometry: Geometry,
    pub revision: Revision,
}

impl Entity {
    pub fn new(
        id: EntityId,
        owner_context_id: ContextId,
        owner_partition_id: PartitionId,
        geometry: Geometry,
    ) -> Self {
        Self {
            id,
            owner_context_id,
            owner_partition_id,
            visibility: Visibility::Visible,
            geometry,
            revision: Revision(1),
        }
    }
}

/// Outcome of reconciling one incoming foreign entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    /// Incoming revision not strictly greater than the local replica's.
    Stale,
    /// Incoming entity claims a different owner for a known id.
    OwnerMismatch,
}

/// Per-context authoritative map of entities.
#[derive(Debug)]
pub struct EntityStore {
    context: ContextId,
    entities: BTreeMap<EntityId, Entity>,
}

impl EntityStore {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            entities: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn is_owned(&self, id: &EntityId) -> bool {
        self.entities
            .get(id)
            .map(|e| e.owner_context_id == self.context)
            .unwrap_or(false)
    }

    /// Entities owned by this context, in id order.
    pub fn owned(&self) -> impl Iterator<Item = &Entity> {
        let ctx = self.context;
        self.entities
            .values()
            .filter(move |e| e.owner_context_id == ctx)
    }

    pub fn owned_count(&self) -> usize {
        self.owned().count()
    }

    /// Insert a newly created entity owned by this context.
    pub fn insert_owned(&mut self, entity: Entity) -> Result<(), SyncError> {
        if entity.owner_context_id != self.context {
            return Err(SyncError::OwnershipViolation {
                entity: entity.id.clone(),
                owner: entity.owner_context_id,
                actor: self.context,
            });
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    /// Mutate an entity owned by this context, bumping its revision.
    ///
    /// Returns the entity after mutation. Mutating a foreign replica is an
    /// `OwnershipViolation`.
    pub fn mutate_owned<F>(&mut self, id: &EntityId, f: F) -> Result<Entity, SyncError>
    where
        F: FnOnce(&mut Entity),
    {
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?;
        if entity.owner_context_id != self.context {
            return Err(SyncError::OwnershipViolation {
                entity: id.clone(),
                owner: entity.owner_context_id,
                actor: self.context,
            });
        }
        f(entity);
        entity.revision = entity.revision.next();
        Ok(entity.clone())
    }

    /// Remove an entity owned by this context.
    pub fn remove_owned(&mut self, id: &EntityId) -> Result<Entity, SyncError> {
        match self.entities.get(id) {
            None => Err(SyncError::EntityNotFound(id.clone())),
            Some(e) if e.owner_context_id != self.context => Err(SyncError::OwnershipViolation {
                entity: id.clone(),
                owner: e.owner_context_id,
                actor: self.context,
            }),
            Some(_) => self
                .entities
                .remove(id)
                .ok_or_else(|| SyncError::EntityNotFound(id.clone())),
        }
    }

    /// Apply one incoming foreign entity under the revision rule: applied only
    /// if strictly newer than the local replica. Owner fields of a known id
    /// must match; a mismatch is rejected.
    pub fn reconcile_foreign(&mut self, incoming: Entity) -> ReconcileOutcome {
        debug_assert_ne!(incoming.owner_context_id, self.context);
        match self.entities.get(&incoming.id) {
            Some(local) if local.owner_context_id != incoming.owner_context_id => {
                ReconcileOutcome::OwnerMismatch
            }
            Some(local) if incoming.revision <= local.revision => ReconcileOutcome::Stale,
            _ => {
                self.entities.insert(incoming.id.clone(), incoming);
                ReconcileOutcome::Applied
            }
        }
    }

    /// Drop foreign replicas whose ids are not in `live`: their owner removed
    /// them from the shared record. Owned entities are never dropped here.
    pub fn retain_foreign<F>(&mut self, live: F) -> Vec<Entity>
    where
        F: Fn(&EntityId) -> bool,
    {
        let ctx = self.context;
        let dead: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.owner_context_id != ctx && !live(&e.id))
            .map(|e| e.id.clone())
            .collect();
        dead.iter()
            .filter_map(|id| self.entities.remove(id))
            .collect()
    }
}
