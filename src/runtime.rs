//! Per-context runtime: wires the resolver, stores, persistence layer,
//! propagation channel, and lifecycle machine into one facade.
//!
//! Each context is internally cooperative: UI-facing operations apply
//! optimistic local state immediately, emit their events, and reconcile with
//! the shared store asynchronously through the debounced persistence flush.
//! The in-process state mutex is never held across a suspension point;
//! cross-operation exclusion per entity id comes from `EntityLocks`.

use crate::channel::{gate, Envelope, GateDecision, Payload};
use crate::config::SyncConfig;
use crate::coordinator::{CoordinatorClient, LivenessAction, LivenessTracker};
use crate::entity::Entity;
use crate::error::SyncError;
use crate::events::{DiagnosticEvent, EngineEvent, EventBus};
use crate::identity::{self, IdentityResolver, IdentityState, PendingMutation};
use crate::lifecycle::{EntityLocks, EpochToken, Lifecycle, ReconcileReport, Transition};
use crate::persist::record::Fingerprint;
use crate::persist::{DebounceState, PersistLayer, SelfWriteStatus};
use crate::sharedstore::{SharedStore, StoreNotice};
use crate::snapshot::CouplingRepair;
use crate::types::{ContextId, EntityId, EntityIdAllocator, Geometry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of a mutation request issued against the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Applied(Entity),
    /// Duplicate restore (or minimize) acknowledged without a state change.
    AlreadySatisfied(Entity),
    Destroyed(EntityId),
    /// Identity unresolved; the mutation is queued for replay.
    Queued,
}

/// Result of processing one store-change notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// Echo of our own write; nothing to reconcile.
    SelfWrite,
    /// Content identical to the most recently applied record.
    DuplicateContent,
    Reconciled { applied: usize, removed: usize },
}

struct RuntimeState {
    resolver: IdentityResolver,
    lifecycle: Option<Lifecycle>,
    allocator: Option<EntityIdAllocator>,
    debounce: DebounceState,
    liveness: LivenessTracker,
}

/// One context's synchronization engine.
pub struct ContextRuntime {
    cfg: SyncConfig,
    store: Arc<dyn SharedStore>,
    client: CoordinatorClient,
    events: EventBus,
    locks: EntityLocks,
    state: Mutex<RuntimeState>,
    persist: Mutex<Option<Arc<PersistLayer>>>,
    /// One inbox channel for the life of the runtime. Reconnects re-register
    /// the sender with the new coordinator generation, so the consumer task
    /// spawned once in `spawn_tasks` keeps draining across restarts.
    inbox_tx: mpsc::UnboundedSender<Envelope>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl ContextRuntime {
    pub fn new(
        cfg: SyncConfig,
        store: Arc<dyn SharedStore>,
        client: CoordinatorClient,
        events: EventBus,
    ) -> Result<Arc<Self>, SyncError> {
        cfg.validate()?;
        let debounce = DebounceState::new(cfg.debounce());
        let liveness = LivenessTracker::new(cfg.heartbeat_miss_threshold);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            state: Mutex::new(RuntimeState {
                resolver: IdentityResolver::new(cfg.max_queued_ops),
                lifecycle: None,
                allocator: None,
                debounce,
                liveness,
            }),
            cfg,
            store,
            client,
            events,
            locks: EntityLocks::new(),
            persist: Mutex::new(None),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.state.lock().resolver.resolved().map(|(ctx, _)| ctx)
    }

    /// Resolve identity, register for direct messages, pull initial state,
    /// and replay any mutations queued while degraded.
    pub async fn init(&self) -> Result<ContextId, SyncError> {
        let reclaim = self.context_id();
        let (context, partition) = match identity::negotiate(&self.client, &self.cfg, reclaim).await
        {
            Ok(pair) => pair,
            Err(err) => {
                // A failed reconnect keeps an already-resolved identity; only
                // a context that never resolved becomes unavailable.
                let mut state = self.state.lock();
                if !state.resolver.is_resolved() {
                    state.resolver.mark_unavailable();
                }
                return Err(err);
            }
        };

        {
            let mut state = self.state.lock();
            state.resolver.mark_resolved(context, partition);
            if state.lifecycle.is_none() {
                state.lifecycle = Some(Lifecycle::new(
                    context,
                    partition,
                    self.cfg.grace_window(),
                ));
                state.allocator = Some(EntityIdAllocator::new(context));
            }
        }
        *self.persist.lock() = Some(Arc::new(PersistLayer::new(
            context,
            self.store.clone(),
            self.cfg.clone(),
        )));

        self.client.register_inbox(context, self.inbox_tx.clone());

        self.resync().await?;

        let queued = self.state.lock().resolver.drain();
        if !queued.is_empty() {
            info!(context = %context, count = queued.len(), "replaying queued mutations");
        }
        for op in queued {
            if let Err(err) = self.replay(op).await {
                warn!(context = %context, %err, "queued mutation failed on replay");
            }
        }

        Ok(context)
    }

    async fn replay(&self, op: PendingMutation) -> Result<OpOutcome, SyncError> {
        match op {
            PendingMutation::Create { geometry } => self.create_entity(geometry).await,
            PendingMutation::Minimize { id } => self.minimize(&id).await,
            PendingMutation::Restore { id } => self.restore(&id).await,
            PendingMutation::Destroy { id } => self.destroy(&id).await,
            PendingMutation::GeometryChangeEnd { id, geometry } => {
                self.on_geometry_change_end(&id, geometry, None).await
            }
        }
    }

    /// Queue `op` if identity is unresolved; error if unavailable.
    fn guard_identity(&self, op: PendingMutation) -> Result<Option<ContextId>, SyncError> {
        let mut state = self.state.lock();
        match state.resolver.state() {
            IdentityState::Resolved { context, .. } => Ok(Some(context)),
            IdentityState::Unresolved => {
                state.resolver.enqueue(op)?;
                Ok(None)
            }
            IdentityState::Unavailable => Err(SyncError::IdentityUnavailable(
                "identity resolution exhausted; mutations rejected".to_string(),
            )),
        }
    }

    fn persist_layer(&self) -> Result<Arc<PersistLayer>, SyncError> {
        self.persist.lock().clone().ok_or_else(|| {
            SyncError::IdentityUnavailable("persistence unavailable before identity".to_string())
        })
    }

    fn emit_transition(&self, context: ContextId, transition: &Transition) {
        match transition {
            Transition::Created(e)
            | Transition::Minimized(e)
            | Transition::GeometryApplied(e)
            | Transition::Restored { entity: e, .. } => {
                self.events.emit(
                    context,
                    EngineEvent::EntityChanged {
                        id: e.id.clone(),
                        owner: e.owner_context_id,
                        visibility: e.visibility,
                        geometry: e.geometry,
                        revision: e.revision,
                    },
                );
            }
            Transition::AlreadyVisible(e) | Transition::AlreadyMinimized(e) => {
                self.events.emit(
                    context,
                    EngineEvent::RestoreAlreadySatisfied { id: e.id.clone() },
                );
            }
            Transition::Destroyed { id, .. } => {
                self.events.emit(
                    context,
                    EngineEvent::EntityDestroyed {
                        id: id.clone(),
                        owner: context,
                    },
                );
            }
        }
    }

    fn emit_failure(&self, context: ContextId, err: &SyncError) {
        match err {
            SyncError::OwnershipViolation { entity, owner, actor } => {
                self.events.emit(
                    context,
                    EngineEvent::Diagnostic(DiagnosticEvent::OwnershipViolation {
                        id: entity.clone(),
                        owner: *owner,
                        actor: *actor,
                    }),
                );
            }
            SyncError::StaleCallback { entity, reason } => {
                self.events.emit(
                    context,
                    EngineEvent::Diagnostic(DiagnosticEvent::StaleCallback {
                        id: entity.clone(),
                        reason: reason.clone(),
                    }),
                );
            }
            SyncError::SnapshotMissing(entity) => {
                self.events.emit(
                    context,
                    EngineEvent::Diagnostic(DiagnosticEvent::SnapshotMissing {
                        id: entity.clone(),
                    }),
                );
            }
            _ => {}
        }
    }

    /// Create a floating window entity owned by this context.
    pub async fn create_entity(&self, geometry: Geometry) -> Result<OpOutcome, SyncError> {
        let context = match self.guard_identity(PendingMutation::Create { geometry })? {
            Some(ctx) => ctx,
            None => return Ok(OpOutcome::Queued),
        };

        let id = {
            let state = self.state.lock();
            match &state.allocator {
                Some(alloc) => alloc.next(),
                None => {
                    return Err(SyncError::IdentityUnavailable(
                        "no id allocator before identity".to_string(),
                    ))
                }
            }
        };

        let _guard = self.locks.acquire(&id).await;
        let transition = {
            let mut state = self.state.lock();
            let transition = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.create(id.clone(), geometry)?,
                None => return Err(SyncError::IdentityUnavailable("no lifecycle".to_string())),
            };
            state.debounce.schedule(Instant::now());
            transition
        };
        self.emit_transition(context, &transition);

        if let Transition::Created(entity) = &transition {
            self.publish_best_effort(entity.clone()).await;
            Ok(OpOutcome::Applied(entity.clone()))
        } else {
            Err(SyncError::InvalidPayload("create produced no entity".to_string()))
        }
    }

    /// Minimize an owned entity, capturing its geometry snapshot.
    pub async fn minimize(&self, id: &EntityId) -> Result<OpOutcome, SyncError> {
        let context = match self.guard_identity(PendingMutation::Minimize { id: id.clone() })? {
            Some(ctx) => ctx,
            None => return Ok(OpOutcome::Queued),
        };

        let _guard = self.locks.acquire(id).await;
        let result = {
            let mut state = self.state.lock();
            let outcome = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.minimize(id),
                None => Err(SyncError::EntityNotFound(id.clone())),
            };
            if matches!(outcome, Ok(Transition::Minimized(_))) {
                state.debounce.schedule(Instant::now());
            }
            outcome
        };

        match result {
            Ok(transition) => {
                self.emit_transition(context, &transition);
                match transition {
                    Transition::Minimized(entity) => {
                        self.publish_best_effort(entity.clone()).await;
                        Ok(OpOutcome::Applied(entity))
                    }
                    Transition::AlreadyMinimized(entity) => {
                        Ok(OpOutcome::AlreadySatisfied(entity))
                    }
                    other => Err(SyncError::InvalidPayload(format!(
                        "unexpected minimize transition: {:?}",
                        other
                    ))),
                }
            }
            Err(err) => {
                self.emit_failure(context, &err);
                Err(err)
            }
        }
    }

    /// Restore an owned entity from its snapshot.
    pub async fn restore(&self, id: &EntityId) -> Result<OpOutcome, SyncError> {
        let context = match self.guard_identity(PendingMutation::Restore { id: id.clone() })? {
            Some(ctx) => ctx,
            None => return Ok(OpOutcome::Queued),
        };

        let _guard = self.locks.acquire(id).await;
        let result = {
            let mut state = self.state.lock();
            let outcome = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.restore(id, Instant::now()),
                None => Err(SyncError::EntityNotFound(id.clone())),
            };
            if matches!(outcome, Ok(Transition::Restored { .. })) {
                state.debounce.schedule(Instant::now());
            }
            outcome
        };

        match result {
            Ok(transition) => {
                if let Transition::Restored {
                    snapshot_missing: true,
                    entity,
                } = &transition
                {
                    self.events.emit(
                        context,
                        EngineEvent::Diagnostic(DiagnosticEvent::SnapshotMissing {
                            id: entity.id.clone(),
                        }),
                    );
                }
                self.emit_transition(context, &transition);
                match transition {
                    Transition::Restored { entity, .. } => {
                        self.publish_best_effort(entity.clone()).await;
                        Ok(OpOutcome::Applied(entity))
                    }
                    Transition::AlreadyVisible(entity) => Ok(OpOutcome::AlreadySatisfied(entity)),
                    other => Err(SyncError::InvalidPayload(format!(
                        "unexpected restore transition: {:?}",
                        other
                    ))),
                }
            }
            Err(err) => {
                self.emit_failure(context, &err);
                Err(err)
            }
        }
    }

    /// Destroy an owned entity and its snapshot.
    pub async fn destroy(&self, id: &EntityId) -> Result<OpOutcome, SyncError> {
        let context = match self.guard_identity(PendingMutation::Destroy { id: id.clone() })? {
            Some(ctx) => ctx,
            None => return Ok(OpOutcome::Queued),
        };

        let _guard = self.locks.acquire(id).await;
        let result = {
            let mut state = self.state.lock();
            let outcome = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.destroy(id),
                None => Err(SyncError::EntityNotFound(id.clone())),
            };
            if let Ok(Transition::Destroyed {
                owner_set_emptied, ..
            }) = &outcome
            {
                state.debounce.schedule(Instant::now());
                if *owner_set_emptied {
                    state.debounce.arm_intentional_empty();
                }
            }
            outcome
        };

        match result {
            Ok(transition) => {
                self.emit_transition(context, &transition);
                Ok(OpOutcome::Destroyed(id.clone()))
            }
            Err(err) => {
                self.emit_failure(context, &err);
                Err(err)
            }
        }
    }

    /// Completion callback from the drag/resize layer.
    ///
    /// `token` is the epoch captured when the callback was scheduled; a
    /// destroy in between invalidates it.
    pub async fn on_geometry_change_end(
        &self,
        id: &EntityId,
        geometry: Geometry,
        token: Option<EpochToken>,
    ) -> Result<OpOutcome, SyncError> {
        let context = match self.guard_identity(PendingMutation::GeometryChangeEnd {
            id: id.clone(),
            geometry,
        })? {
            Some(ctx) => ctx,
            None => return Ok(OpOutcome::Queued),
        };

        let _guard = self.locks.acquire(id).await;
        let result = {
            let mut state = self.state.lock();
            let outcome = match state.lifecycle.as_mut() {
                Some(lifecycle) => {
                    lifecycle.geometry_change_end(id, geometry, context, token.as_ref())
                }
                None => Err(SyncError::EntityNotFound(id.clone())),
            };
            if matches!(outcome, Ok(Transition::GeometryApplied(_))) {
                state.debounce.schedule(Instant::now());
            }
            outcome
        };

        match result {
            Ok(transition) => {
                self.emit_transition(context, &transition);
                match transition {
                    Transition::GeometryApplied(entity) => {
                        self.publish_best_effort(entity.clone()).await;
                        Ok(OpOutcome::Applied(entity))
                    }
                    other => Err(SyncError::InvalidPayload(format!(
                        "unexpected geometry transition: {:?}",
                        other
                    ))),
                }
            }
            Err(err) => {
                self.emit_failure(context, &err);
                Err(err)
            }
        }
    }

    /// Epoch token for scheduling callbacks against an entity.
    pub fn epoch_token(&self, id: &EntityId) -> Option<EpochToken> {
        self.state
            .lock()
            .lifecycle
            .as_ref()
            .and_then(|l| l.epoch_token(id))
    }

    /// Read-only view of an entity.
    pub fn entity(&self, id: &EntityId) -> Option<Entity> {
        self.state
            .lock()
            .lifecycle
            .as_ref()
            .and_then(|l| l.entities().get(id).cloned())
    }

    pub fn snapshot_exists(&self, id: &EntityId) -> bool {
        self.state
            .lock()
            .lifecycle
            .as_ref()
            .map(|l| l.snapshots().contains(id))
            .unwrap_or(false)
    }

    /// Push an update through the coordinator's low-latency path. Failures
    /// are logged and absorbed: the store-change path remains the path of
    /// record.
    async fn publish_best_effort(&self, entity: Entity) {
        if let Err(err) = self.client.publish_update(entity).await {
            match err {
                SyncError::CoordinatorRestarted { observed } => {
                    if let Some(ctx) = self.context_id() {
                        self.events.emit(
                            ctx,
                            EngineEvent::Diagnostic(DiagnosticEvent::CoordinatorRestarted {
                                generation: observed,
                            }),
                        );
                    }
                }
                err => debug!(%err, "direct publish failed; store path will cover it"),
            }
        }
    }

    /// Flush any pending debounced write immediately. Returns the committed
    /// fingerprint, or `None` when nothing was pending.
    pub async fn flush_now(&self) -> Result<Option<Fingerprint>, SyncError> {
        let (pending, owned) = {
            let mut state = self.state.lock();
            let pending = state.debounce.take_pending();
            let owned = state
                .lifecycle
                .as_ref()
                .map(|l| l.owned_entities())
                .unwrap_or_default();
            (pending, owned)
        };
        self.flush_inner(pending, owned).await
    }

    /// Flush if the debounce deadline has passed. Driven by the timer task.
    pub async fn flush_due(&self) -> Result<Option<Fingerprint>, SyncError> {
        let (pending, owned) = {
            let mut state = self.state.lock();
            let pending = state.debounce.take_due(Instant::now());
            let owned = state
                .lifecycle
                .as_ref()
                .map(|l| l.owned_entities())
                .unwrap_or_default();
            (pending, owned)
        };
        self.flush_inner(pending, owned).await
    }

    async fn flush_inner(
        &self,
        pending: Option<bool>,
        owned: Vec<Entity>,
    ) -> Result<Option<Fingerprint>, SyncError> {
        let intentional_empty = match pending {
            Some(flag) => flag,
            None => return Ok(None),
        };
        let persist = self.persist_layer()?;
        match persist.commit_owned(owned, intentional_empty).await {
            Ok(fingerprint) => Ok(Some(fingerprint)),
            Err(err) => {
                // Keep the write pending and retried; the local state stays
                // optimistic, flagged rather than silently confirmed.
                let context = self.context_id();
                {
                    let mut state = self.state.lock();
                    state.debounce.schedule(Instant::now());
                    if intentional_empty {
                        state.debounce.arm_intentional_empty();
                    }
                }
                if let Some(ctx) = context {
                    self.events.emit(
                        ctx,
                        EngineEvent::Diagnostic(DiagnosticEvent::PersistencePending {
                            owner: ctx,
                        }),
                    );
                }
                Err(err)
            }
        }
    }

    /// Expire restore grace windows, consuming their snapshots.
    pub fn expire_grace(&self) -> Vec<EntityId> {
        let mut state = self.state.lock();
        match state.lifecycle.as_mut() {
            Some(lifecycle) => lifecycle.expire_restore_grace(Instant::now()),
            None => Vec::new(),
        }
    }

    /// Run the snapshot coupling audit, surfacing repairs as diagnostics.
    pub fn audit_snapshots(&self) -> usize {
        let (repairs, context) = {
            let mut state = self.state.lock();
            let context = state.resolver.resolved().map(|(c, _)| c);
            let repairs = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.audit_snapshots(),
                None => Vec::new(),
            };
            (repairs, context)
        };
        if let Some(ctx) = context {
            for repair in &repairs {
                let id = match repair {
                    CouplingRepair::DroppedStale(id) | CouplingRepair::Reconstructed(id) => {
                        id.clone()
                    }
                };
                self.events.emit(
                    ctx,
                    EngineEvent::Diagnostic(DiagnosticEvent::SnapshotRepaired { id }),
                );
            }
        }
        repairs.len()
    }

    /// Process one store-change notice: self-write check, content dedup,
    /// then a read and revision-gated reconcile.
    pub async fn handle_notice(&self, notice: StoreNotice) -> Result<NoticeOutcome, SyncError> {
        let persist = self.persist_layer()?;
        match persist.classify_notice(&notice.write_id) {
            SelfWriteStatus::Own => {
                debug!(write_id = %notice.write_id, "self-write echo ignored");
                return Ok(NoticeOutcome::SelfWrite);
            }
            SelfWriteStatus::ExpiredOwn => {
                if let Some(ctx) = self.context_id() {
                    self.events.emit(
                        ctx,
                        EngineEvent::Diagnostic(DiagnosticEvent::SelfWriteExpired {
                            write_id: notice.write_id.clone(),
                        }),
                    );
                }
                // Falls through: reconciling our own state is redundant but
                // safe.
            }
            SelfWriteStatus::Foreign => {}
        }

        let record = persist.read_record().await?;
        let fingerprint = record.fingerprint();
        if persist.is_duplicate(&fingerprint) {
            debug!(%fingerprint, "duplicate record content dropped");
            return Ok(NoticeOutcome::DuplicateContent);
        }

        let (report, context) = {
            let mut state = self.state.lock();
            let context = state.resolver.resolved().map(|(c, _)| c);
            let report = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.reconcile_record(&record),
                None => return Ok(NoticeOutcome::Reconciled { applied: 0, removed: 0 }),
            };
            (report, context)
        };
        persist.note_applied(fingerprint);

        if let Some(ctx) = context {
            self.emit_reconcile(ctx, &report);
        }

        Ok(NoticeOutcome::Reconciled {
            applied: report.applied.len(),
            removed: report.removed.len(),
        })
    }

    fn emit_reconcile(&self, context: ContextId, report: &ReconcileReport) {
        for entity in &report.applied {
            self.events.emit(
                context,
                EngineEvent::EntityChanged {
                    id: entity.id.clone(),
                    owner: entity.owner_context_id,
                    visibility: entity.visibility,
                    geometry: entity.geometry,
                    revision: entity.revision,
                },
            );
        }
        for entity in &report.removed {
            self.events.emit(
                context,
                EngineEvent::EntityDestroyed {
                    id: entity.id.clone(),
                    owner: entity.owner_context_id,
                },
            );
        }
        for id in &report.owner_mismatches {
            if let Some(local) = self.entity(id) {
                self.events.emit(
                    context,
                    EngineEvent::Diagnostic(DiagnosticEvent::OwnershipViolation {
                        id: id.clone(),
                        owner: local.owner_context_id,
                        actor: context,
                    }),
                );
            }
        }
    }

    /// Process one direct message relayed by the coordinator.
    pub async fn handle_direct(&self, envelope: Envelope) -> Result<(), SyncError> {
        envelope.payload.validate()?;
        match envelope.payload {
            Payload::EntityUpdate { entity } => {
                let context = match self.context_id() {
                    Some(ctx) => ctx,
                    None => return Ok(()),
                };
                if entity.owner_context_id == context {
                    // Echo of our own update through the relay.
                    return Ok(());
                }
                let local = self.entity(&entity.id).map(|e| e.revision);
                match gate(local, entity.revision) {
                    GateDecision::Apply => {
                        let applied = {
                            let mut state = self.state.lock();
                            match state.lifecycle.as_mut() {
                                Some(lifecycle) => {
                                    lifecycle.apply_foreign_update(entity.clone())
                                }
                                None => return Ok(()),
                            }
                        };
                        if applied == crate::entity::ReconcileOutcome::Applied {
                            self.events.emit(
                                context,
                                EngineEvent::EntityChanged {
                                    id: entity.id.clone(),
                                    owner: entity.owner_context_id,
                                    visibility: entity.visibility,
                                    geometry: entity.geometry,
                                    revision: entity.revision,
                                },
                            );
                        }
                        Ok(())
                    }
                    GateDecision::Duplicate | GateDecision::Stale => {
                        debug!(id = %entity.id, "discarded non-newer direct update");
                        Ok(())
                    }
                    GateDecision::Resync { local, incoming } => {
                        self.events.emit(
                            context,
                            EngineEvent::Diagnostic(DiagnosticEvent::ResyncTriggered {
                                id: entity.id.clone(),
                                local,
                                incoming,
                            }),
                        );
                        self.resync().await.map(|_| ())
                    }
                }
            }
            Payload::GeometryChangeEnd { id, geometry, actor } => {
                let context = self.context_id();
                // Foreign senders cannot move our windows: validated against
                // ownership in the lifecycle, surfaced as a diagnostic.
                if context.is_some() && Some(actor) != context {
                    let err = match self.entity(&id) {
                        Some(local) => SyncError::OwnershipViolation {
                            entity: id.clone(),
                            owner: local.owner_context_id,
                            actor,
                        },
                        None => SyncError::StaleCallback {
                            entity: id.clone(),
                            reason: "geometry end for unknown entity".to_string(),
                        },
                    };
                    if let Some(ctx) = context {
                        self.emit_failure(ctx, &err);
                    }
                    return Err(err);
                }
                self.on_geometry_change_end(&id, geometry, None)
                    .await
                    .map(|_| ())
            }
            Payload::FullSyncRequest => self.resync().await.map(|_| ()),
            other => {
                debug!(payload = ?other, "ignoring direct message");
                Ok(())
            }
        }
    }

    /// Pull the full shared record and reconcile against it.
    pub async fn resync(&self) -> Result<NoticeOutcome, SyncError> {
        let persist = self.persist_layer()?;
        let record = persist.read_record().await?;
        let fingerprint = record.fingerprint();
        let (report, context) = {
            let mut state = self.state.lock();
            let context = state.resolver.resolved().map(|(c, _)| c);
            let report = match state.lifecycle.as_mut() {
                Some(lifecycle) => lifecycle.reconcile_record(&record),
                None => return Ok(NoticeOutcome::Reconciled { applied: 0, removed: 0 }),
            };
            (report, context)
        };
        persist.note_applied(fingerprint);
        if let Some(ctx) = context {
            self.emit_reconcile(ctx, &report);
        }
        Ok(NoticeOutcome::Reconciled {
            applied: report.applied.len(),
            removed: report.removed.len(),
        })
    }

    /// One liveness probe; escalates to reconnect after the configured miss
    /// threshold, and to a degraded state when reconnection keeps failing.
    pub async fn heartbeat_once(&self) -> Result<(), SyncError> {
        let context = match self.context_id() {
            Some(ctx) => ctx,
            None => return Ok(()),
        };
        match self.client.heartbeat(context).await {
            Ok(_generation) => {
                self.state.lock().liveness.record_success();
                Ok(())
            }
            Err(SyncError::CoordinatorRestarted { observed }) => {
                self.events.emit(
                    context,
                    EngineEvent::Diagnostic(DiagnosticEvent::CoordinatorRestarted {
                        generation: observed,
                    }),
                );
                // The old registration died with the old generation; resume
                // identity negotiation and re-register.
                self.init().await.map(|_| ())
            }
            Err(err) => {
                let action = self.state.lock().liveness.record_miss();
                debug!(%err, ?action, "heartbeat missed");
                if action == LivenessAction::Reconnect {
                    match self.init().await {
                        Ok(_) => {
                            self.state.lock().liveness.record_success();
                            Ok(())
                        }
                        Err(reconnect_err) => {
                            self.state.lock().liveness.mark_degraded();
                            warn!(%reconnect_err, "reconnect failed; entering degraded state");
                            Err(reconnect_err)
                        }
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().liveness.is_degraded()
    }

    /// Spawn the background loops: store notices, direct inbox, debounce
    /// flush, grace expiry, and heartbeat.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let mut notices = self.store.subscribe();
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Ok(notice) = notices.recv().await {
                if let Err(err) = runtime.handle_notice(notice).await {
                    warn!(%err, "notice handling failed");
                }
            }
        });

        if let Some(mut inbox) = self.inbox_rx.lock().take() {
            let runtime = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = inbox.recv().await {
                    if let Err(err) = runtime.handle_direct(envelope).await {
                        debug!(%err, "direct message rejected");
                    }
                }
            });
        }

        let runtime = self.clone();
        let tick = Duration::from_millis(self.cfg.debounce_ms.max(10) / 2);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                runtime.expire_grace();
                runtime.audit_snapshots();
                if let Err(err) = runtime.flush_due().await {
                    debug!(%err, "debounced flush failed; will retry");
                }
            }
        });

        let runtime = self.clone();
        let interval = self.cfg.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let _ = runtime.heartbeat_once().await;
            }
        });
    }
}
