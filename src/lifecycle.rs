//! Lifecycle State Machine.
//!
//! Drives each entity through `Creating → Visible ⇄ Minimized → Destroyed`,
//! keeping the entity store, the transient snapshot store, and scheduled
//! persistence consistent. Transitions are synchronous and deterministic
//! (time is injected); the async per-id exclusion lock lives alongside so a
//! minimize and a restore on the same entity can never interleave, and
//! requests arriving while a lock is held are served in arrival order.

use crate::entity::{Entity, EntityStore, ReconcileOutcome};
use crate::error::SyncError;
use crate::snapshot::{CouplingRepair, SnapshotStore};
use crate::types::{ContextId, EntityId, Geometry, PartitionId, Visibility};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Epoch captured when scheduling a callback; checked before the callback
/// acts. Destroy advances the epoch, invalidating everything scheduled
/// before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochToken {
    pub id: EntityId,
    pub epoch: u64,
}

/// Outcome of a lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Created(Entity),
    Minimized(Entity),
    /// Minimize on an already-minimized entity: acknowledged, no change.
    AlreadyMinimized(Entity),
    Restored {
        entity: Entity,
        /// The snapshot was missing; geometry reconstructed from last-known
        /// entity state. A diagnostic, never a silent no-op.
        snapshot_missing: bool,
    },
    /// Restore on an already-visible entity (e.g. a double click inside the
    /// grace window): acknowledged, no change.
    AlreadyVisible(Entity),
    Destroyed {
        id: EntityId,
        /// The destroy emptied this owner's entity set; the next persistence
        /// write must carry the intentional-empty marker.
        owner_set_emptied: bool,
    },
    GeometryApplied(Entity),
}

/// Per-context lifecycle machine over the entity and snapshot stores.
#[derive(Debug)]
pub struct Lifecycle {
    context: ContextId,
    partition: PartitionId,
    entities: EntityStore,
    snapshots: SnapshotStore,
    epochs: HashMap<EntityId, u64>,
    /// Restores inside their grace window; snapshots are deleted only once
    /// the window has elapsed, so duplicate restore requests stay idempotent.
    restore_grace: HashMap<EntityId, Instant>,
    grace_window: Duration,
}

impl Lifecycle {
    pub fn new(context: ContextId, partition: PartitionId, grace_window: Duration) -> Self {
        Self {
            context,
            partition,
            entities: EntityStore::new(context),
            snapshots: SnapshotStore::new(),
            epochs: HashMap::new(),
            restore_grace: HashMap::new(),
            grace_window,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn owned_entities(&self) -> Vec<Entity> {
        self.entities.owned().cloned().collect()
    }

    /// Current epoch token for an entity, captured when scheduling callbacks.
    pub fn epoch_token(&self, id: &EntityId) -> Option<EpochToken> {
        self.epochs.get(id).map(|epoch| EpochToken {
            id: id.clone(),
            epoch: *epoch,
        })
    }

    /// Create a new owned entity, `Visible` at revision one.
    ///
    /// Callers must hold a resolved identity; the runtime queues creation
    /// while identity is pending, so an entity never leaves `Creating`
    /// without a valid owner attached.
    pub fn create(&mut self, id: EntityId, geometry: Geometry) -> Result<Transition, SyncError> {
        let entity = Entity::new(id.clone(), self.context, self.partition, geometry);
        self.entities.insert_owned(entity.clone())?;
        self.epochs.insert(id, 0);
        Ok(Transition::Created(entity))
    }

    /// Minimize: capture geometry into a snapshot, flip visibility, bump the
    /// revision. One logical unit; on failure the captured snapshot is
    /// rolled back so no path observes a half-applied transition.
    pub fn minimize(&mut self, id: &EntityId) -> Result<Transition, SyncError> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?
            .clone();
        if entity.visibility == Visibility::Minimized {
            return Ok(Transition::AlreadyMinimized(entity));
        }

        self.snapshots.capture(id.clone(), entity.geometry);
        match self.entities.mutate_owned(id, |e| {
            e.visibility = Visibility::Minimized;
        }) {
            Ok(updated) => {
                self.restore_grace.remove(id);
                Ok(Transition::Minimized(updated))
            }
            Err(err) => {
                self.snapshots.remove(id);
                Err(err)
            }
        }
    }

    /// Restore: apply the snapshot geometry, flip visibility, bump the
    /// revision. The snapshot is consumed read-then-delete: deletion only
    /// happens after the grace window, via `expire_restore_grace`, so a
    /// duplicate restore arriving early is acknowledged instead of failing.
    pub fn restore(&mut self, id: &EntityId, now: Instant) -> Result<Transition, SyncError> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?
            .clone();
        if entity.visibility == Visibility::Visible {
            debug!(context = %self.context, %id, "restore on visible entity acknowledged");
            return Ok(Transition::AlreadyVisible(entity));
        }

        let (geometry, snapshot_missing) = match self.snapshots.peek(id) {
            Some(snapshot) => (snapshot.geometry, false),
            None => {
                warn!(
                    context = %self.context, %id,
                    "restore with no saved geometry; reconstructing from last-known state"
                );
                (entity.geometry, true)
            }
        };

        let updated = self.entities.mutate_owned(id, |e| {
            e.geometry = geometry;
            e.visibility = Visibility::Visible;
        })?;
        self.restore_grace.insert(id.clone(), now);
        Ok(Transition::Restored {
            entity: updated,
            snapshot_missing,
        })
    }

    /// Delete snapshots whose restore grace window has elapsed. Returns the
    /// entity ids whose snapshots were consumed.
    pub fn expire_restore_grace(&mut self, now: Instant) -> Vec<EntityId> {
        let window = self.grace_window;
        let expired: Vec<EntityId> = self
            .restore_grace
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.restore_grace.remove(id);
            self.snapshots.remove(id);
        }
        expired
    }

    /// Destroy: remove the entity and any snapshot atomically, advance the
    /// epoch so stale callbacks are rejected, and report whether the owner's
    /// entity set is now empty (the only path allowed to arm the
    /// intentional-empty persistence marker).
    pub fn destroy(&mut self, id: &EntityId) -> Result<Transition, SyncError> {
        self.entities.remove_owned(id)?;
        self.snapshots.remove(id);
        self.restore_grace.remove(id);
        self.epochs.remove(id);
        Ok(Transition::Destroyed {
            id: id.clone(),
            owner_set_emptied: self.entities.owned_count() == 0,
        })
    }

    /// Completion callback from the drag/resize layer. Only valid for an
    /// owned, `Visible` entity with a current epoch; anything else is stale
    /// or foreign and is rejected, never applied.
    pub fn geometry_change_end(
        &mut self,
        id: &EntityId,
        geometry: Geometry,
        actor: ContextId,
        token: Option<&EpochToken>,
    ) -> Result<Transition, SyncError> {
        let entity = match self.entities.get(id) {
            Some(e) => e.clone(),
            None => {
                return Err(SyncError::StaleCallback {
                    entity: id.clone(),
                    reason: "entity destroyed or unknown".to_string(),
                })
            }
        };
        if entity.owner_context_id != actor {
            return Err(SyncError::OwnershipViolation {
                entity: id.clone(),
                owner: entity.owner_context_id,
                actor,
            });
        }
        if let Some(token) = token {
            let current = self.epochs.get(id).copied();
            if current != Some(token.epoch) {
                return Err(SyncError::StaleCallback {
                    entity: id.clone(),
                    reason: "epoch advanced since callback was scheduled".to_string(),
                });
            }
        }
        if entity.visibility != Visibility::Visible {
            return Err(SyncError::StaleCallback {
                entity: id.clone(),
                reason: "entity is minimized".to_string(),
            });
        }

        let updated = self.entities.mutate_owned(id, |e| {
            e.geometry = geometry;
        })?;
        Ok(Transition::GeometryApplied(updated))
    }

    /// Apply one foreign entity update that already passed the revision gate.
    pub fn apply_foreign_update(&mut self, entity: Entity) -> ReconcileOutcome {
        self.entities.reconcile_foreign(entity)
    }

    /// Reconcile a full shared-store record: foreign entities are applied if
    /// newer, foreign replicas their owner removed are dropped, owned
    /// entities are untouched (this context is authoritative for them).
    pub fn reconcile_record(
        &mut self,
        record: &crate::persist::record::PersistedRecord,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for entity in &record.entities {
            if entity.owner_context_id == self.context {
                continue;
            }
            match self.entities.reconcile_foreign(entity.clone()) {
                ReconcileOutcome::Applied => report.applied.push(entity.clone()),
                ReconcileOutcome::Stale => {}
                ReconcileOutcome::OwnerMismatch => {
                    warn!(context = %self.context, id = %entity.id, "owner mismatch in record; rejected");
                    report.owner_mismatches.push(entity.id.clone());
                }
            }
        }

        report.removed = self.entities.retain_foreign(|id| record.contains(id));
        report
    }

    /// Run the snapshot coupling audit and log any repairs. Snapshots held
    /// open by an unexpired restore grace window are not corruption.
    pub fn audit_snapshots(&mut self) -> Vec<CouplingRepair> {
        let grace = &self.restore_grace;
        let repairs = self
            .snapshots
            .audit(&self.entities, |id| grace.contains_key(id));
        for repair in &repairs {
            warn!(context = %self.context, ?repair, "snapshot coupling repaired");
        }
        repairs
    }
}

/// Result of reconciling a full record.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub applied: Vec<Entity>,
    pub removed: Vec<Entity>,
    pub owner_mismatches: Vec<EntityId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.removed.is_empty() && self.owner_mismatches.is_empty()
    }
}

struct LockState {
    /// Key present means the lock is held; the queue holds FIFO waiters.
    held: HashMap<EntityId, VecDeque<oneshot::Sender<()>>>,
}

/// Per-entity logical exclusion locks with FIFO hand-off.
#[derive(Clone)]
pub struct EntityLocks {
    inner: Arc<Mutex<LockState>>,
}

impl Default for EntityLocks {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LockState {
                held: HashMap::new(),
            })),
        }
    }
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, waiting in arrival order if held.
    pub async fn acquire(&self, id: &EntityId) -> EntityLockGuard {
        loop {
            let waiter = {
                let mut state = self.inner.lock();
                match state.held.get_mut(id) {
                    None => {
                        state.held.insert(id.clone(), VecDeque::new());
                        None
                    }
                    Some(queue) => {
                        let (tx, rx) = oneshot::channel();
                        queue.push_back(tx);
                        Some(rx)
                    }
                }
            };
            match waiter {
                None => {
                    return EntityLockGuard {
                        inner: self.inner.clone(),
                        id: id.clone(),
                    }
                }
                Some(rx) => {
                    // A successful receive is a hand-off: the previous guard
                    // kept the held entry alive for us.
                    if rx.await.is_ok() {
                        return EntityLockGuard {
                            inner: self.inner.clone(),
                            id: id.clone(),
                        };
                    }
                }
            }
        }
    }
}

/// Held lock; dropping hands off to the next waiter in FIFO order.
pub struct EntityLockGuard {
    inner: Arc<Mutex<LockState>>,
    id: EntityId,
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if let Some(queue) = state.held.get_mut(&self.id) {
            loop {
                match queue.pop_front() {
                    Some(tx) => {
                        if tx.send(()).is_ok() {
                            return;
                        }
                        // Waiter gave up; try the next one.
                    }
                    None => {
                        state.held.remove(&self.id);
                        return;
                    }
                }
            }
        }
    }
}
