//! Change Propagation Channel types and the revision gate.
//!
//! Two delivery paths cooperate: store-change notices (the path of record,
//! eventually delivered, unordered) and direct messages relayed through the
//! coordinator (a latency optimization, best-effort). Message payloads are a
//! closed set of tagged variants validated at the channel boundary before
//! dispatch; a malformed payload never reaches a handler.

use crate::entity::Entity;
use crate::error::SyncError;
use crate::types::{ContextId, EntityId, GenerationId, Geometry, PartitionId, Revision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Closed set of message payloads exchanged between contexts and the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    /// Full entity state pushed after a local mutation.
    EntityUpdate { entity: Entity },
    /// Completion callback from the drag/resize layer.
    GeometryChangeEnd {
        id: EntityId,
        geometry: Geometry,
        actor: ContextId,
    },
    /// `reclaim` carries a previously assigned id so a context keeps its
    /// identity across coordinator restarts.
    IdentityRequest { reclaim: Option<ContextId> },
    IdentityResponse {
        context_id: ContextId,
        partition_id: PartitionId,
    },
    Heartbeat { from: ContextId },
    HeartbeatAck,
    Ack,
    /// Ask a context to pull full state from the shared store.
    FullSyncRequest,
}

impl Payload {
    /// Boundary validation: structural checks a handler may rely on.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Payload::EntityUpdate { entity } => {
                if entity.revision == Revision(0) {
                    return Err(SyncError::InvalidPayload(format!(
                        "entity update for {} carries revision zero",
                        entity.id
                    )));
                }
                validate_geometry(&entity.id, &entity.geometry)
            }
            Payload::GeometryChangeEnd { id, geometry, .. } => validate_geometry(id, geometry),
            _ => Ok(()),
        }
    }
}

fn validate_geometry(id: &EntityId, geometry: &Geometry) -> Result<(), SyncError> {
    if geometry.width == 0 || geometry.height == 0 {
        return Err(SyncError::InvalidPayload(format!(
            "zero-sized geometry for {}",
            id
        )));
    }
    Ok(())
}

/// Message envelope. No cross-context ordering is guaranteed; `sequence_id`
/// provides best-effort same-sender FIFO only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: u64,
    pub sent_at: DateTime<Utc>,
    pub sequence_id: Option<u64>,
    /// Generation stamped by the coordinator on everything it sends.
    pub generation: Option<GenerationId>,
    pub payload: Payload,
}

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn next_correlation_id() -> u64 {
    CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            correlation_id: next_correlation_id(),
            sent_at: Utc::now(),
            sequence_id: None,
            generation: None,
            payload,
        }
    }

    pub fn with_generation(mut self, generation: GenerationId) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_sequence(mut self, sequence_id: u64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }
}

/// Decision for one incoming entity update, per the ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Strictly next revision: apply.
    Apply,
    /// Equal revision: a safe duplicate, ignore without error.
    Duplicate,
    /// Older revision: discard, never queue.
    Stale,
    /// Revision gap. Buffering would assume an ordering guarantee that does
    /// not exist; pull full state from the shared store instead.
    Resync { local: Revision, incoming: Revision },
}

/// Gate an incoming per-entity update against the locally held revision.
///
/// `local` is `None` when no replica exists yet, which behaves as revision
/// zero: a fresh entity at revision one applies, anything further ahead is a
/// gap.
pub fn gate(local: Option<Revision>, incoming: Revision) -> GateDecision {
    let local = local.unwrap_or(Revision(0));
    if incoming == local {
        GateDecision::Duplicate
    } else if incoming < local {
        GateDecision::Stale
    } else if incoming == local.next() {
        GateDecision::Apply
    } else {
        GateDecision::Resync { local, incoming }
    }
}
