//! Consumer-facing event stream.
//!
//! The rendering layer and the management panel subscribe here. Structural
//! failures (ownership violations, missing snapshots, stale callbacks) are
//! never absorbed silently; they surface as diagnostic events even when the
//! user-visible effect is "nothing happened".

use crate::types::{ContextId, EntityId, GenerationId, Geometry, Revision, Visibility};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// Diagnostic transition events for conditions that must stay observable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DiagnosticEvent {
    /// Restore attempted with no saved geometry; entity reconstructed from
    /// last-known state.
    SnapshotMissing { id: EntityId },
    /// Snapshot coupling audit repaired a corruption.
    SnapshotRepaired { id: EntityId },
    OwnershipViolation {
        id: EntityId,
        owner: ContextId,
        actor: ContextId,
    },
    StaleCallback { id: EntityId, reason: String },
    CoordinatorRestarted { generation: GenerationId },
    /// Local mutation applied, durable write not yet confirmed.
    PersistencePending { owner: ContextId },
    /// A self-write id expired before its notification arrived.
    SelfWriteExpired { write_id: String },
    /// A revision gap forced a full-state resynchronization.
    ResyncTriggered {
        id: EntityId,
        local: Revision,
        incoming: Revision,
    },
}

/// Events published to consumers of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    EntityChanged {
        id: EntityId,
        owner: ContextId,
        visibility: Visibility,
        geometry: Geometry,
        revision: Revision,
    },
    EntityDestroyed { id: EntityId, owner: ContextId },
    /// A duplicate restore inside the grace window: acknowledged, no state
    /// change.
    RestoreAlreadySatisfied { id: EntityId },
    Diagnostic(DiagnosticEvent),
}

impl EngineEvent {
    /// Owner context this event is attributable to, where one exists.
    pub fn owner(&self) -> Option<ContextId> {
        match self {
            EngineEvent::EntityChanged { owner, .. } => Some(*owner),
            EngineEvent::EntityDestroyed { owner, .. } => Some(*owner),
            _ => None,
        }
    }
}

/// Event plus emission metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Context that emitted the event
    pub context: ContextId,
    pub at: DateTime<Utc>,
    pub event: EngineEvent,
}

impl EventEnvelope {
    pub fn with_now(context: ContextId, event: EngineEvent) -> Self {
        Self {
            context,
            at: Utc::now(),
            event,
        }
    }
}

struct Subscriber {
    /// Panel subscriptions only receive entity events for this owner.
    owner_filter: Option<ContextId>,
    sender: Sender<EventEnvelope>,
}

/// In-process fan-out bus for engine events.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> Receiver<EventEnvelope> {
        self.attach(None)
    }

    /// Subscribe filtered to entities owned by one context, as the management
    /// panel does. Entity events from foreign owners are never delivered.
    pub fn subscribe_owner(&self, owner: ContextId) -> Receiver<EventEnvelope> {
        self.attach(Some(owner))
    }

    fn attach(&self, owner_filter: Option<ContextId>) -> Receiver<EventEnvelope> {
        let (sender, receiver) = channel();
        self.subscribers.lock().push(Subscriber {
            owner_filter,
            sender,
        });
        receiver
    }

    /// Emit an event to all matching subscribers. Disconnected subscribers
    /// are dropped. The owner filter only applies to events attributable to
    /// an owner; ownerless events (diagnostics, restore acknowledgements)
    /// reach every subscriber.
    pub fn emit(&self, context: ContextId, event: EngineEvent) {
        let envelope = EventEnvelope::with_now(context, event);
        let mut subs = self.subscribers.lock();
        subs.retain(|sub| {
            if let (Some(filter), Some(owner)) = (sub.owner_filter, envelope.event.owner()) {
                if owner != filter {
                    return true;
                }
            }
            sub.sender.send(envelope.clone()).is_ok()
        });
    }
}
