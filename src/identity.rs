//! Identity Resolver.
//!
//! A context cannot determine its own identifier locally; resolution is a
//! round trip to the coordinator, which may itself be unavailable or mid
//! restart. Until resolved the context runs degraded: it refuses to
//! attribute ownership (no sentinel values) and queues mutation-producing
//! operations instead of dropping them or writing with a null owner.

use crate::config::SyncConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::SyncError;
use crate::types::{ContextId, EntityId, Geometry, PartitionId};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Resolution state for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Unresolved,
    Resolved {
        context: ContextId,
        partition: PartitionId,
    },
    /// Retries exhausted; mutations are rejected until resolution succeeds.
    Unavailable,
}

/// A mutation deferred while identity is unresolved, replayed in arrival
/// order once resolution succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
    Create { geometry: Geometry },
    Minimize { id: EntityId },
    Restore { id: EntityId },
    Destroy { id: EntityId },
    GeometryChangeEnd { id: EntityId, geometry: Geometry },
}

/// Per-context identity bookkeeping and degraded-mode queue.
#[derive(Debug)]
pub struct IdentityResolver {
    state: IdentityState,
    queued: VecDeque<PendingMutation>,
    max_queued: usize,
}

impl IdentityResolver {
    pub fn new(max_queued: usize) -> Self {
        Self {
            state: IdentityState::Unresolved,
            queued: VecDeque::new(),
            max_queued,
        }
    }

    pub fn state(&self) -> IdentityState {
        self.state
    }

    pub fn resolved(&self) -> Option<(ContextId, PartitionId)> {
        match self.state {
            IdentityState::Resolved { context, partition } => Some((context, partition)),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, IdentityState::Resolved { .. })
    }

    pub fn mark_resolved(&mut self, context: ContextId, partition: PartitionId) {
        self.state = IdentityState::Resolved { context, partition };
    }

    pub fn mark_unavailable(&mut self) {
        self.state = IdentityState::Unavailable;
    }

    /// Reset to unresolved, e.g. after a coordinator restart invalidates the
    /// negotiation in flight.
    pub fn mark_unresolved(&mut self) {
        if !self.is_resolved() {
            self.state = IdentityState::Unresolved;
        }
    }

    /// Queue a mutation while unresolved. The queue is bounded; overflow
    /// rejects the newest operation so earlier user intent is kept.
    pub fn enqueue(&mut self, op: PendingMutation) -> Result<(), SyncError> {
        if self.queued.len() >= self.max_queued {
            warn!(queued = self.queued.len(), "degraded-mode mutation queue full");
            return Err(SyncError::IdentityUnavailable(
                "mutation queue full while identity unresolved".to_string(),
            ));
        }
        self.queued.push_back(op);
        Ok(())
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Drain queued mutations for replay, in arrival order.
    pub fn drain(&mut self) -> Vec<PendingMutation> {
        self.queued.drain(..).collect()
    }
}

/// Negotiate an identity with the coordinator.
///
/// Timeouts and transport failures retry with exponential backoff up to the
/// configured budget. A coordinator restart observed mid-negotiation is not
/// a failed attempt: the request is reissued against the new generation,
/// bounded separately so a flapping coordinator still terminates.
pub async fn negotiate(
    client: &CoordinatorClient,
    cfg: &SyncConfig,
    reclaim: Option<ContextId>,
) -> Result<(ContextId, PartitionId), SyncError> {
    let mut attempts = 0usize;
    let mut restarts = 0usize;
    loop {
        match client.request_identity(reclaim).await {
            Ok((context, partition)) => {
                info!(%context, %partition, "identity resolved");
                return Ok((context, partition));
            }
            Err(SyncError::CoordinatorRestarted { observed }) => {
                restarts += 1;
                debug!(%observed, restarts, "restart during identity negotiation, reissuing");
                if restarts > cfg.max_identity_retries {
                    return Err(SyncError::IdentityUnavailable(format!(
                        "coordinator restarted {} times during negotiation",
                        restarts
                    )));
                }
            }
            Err(err) => {
                attempts += 1;
                if attempts >= cfg.max_identity_retries {
                    warn!(attempts, %err, "identity resolution retries exhausted");
                    return Err(SyncError::IdentityUnavailable(format!(
                        "resolution failed after {} attempts: {}",
                        attempts, err
                    )));
                }
                debug!(attempts, %err, "identity resolution attempt failed, backing off");
                tokio::time::sleep(cfg.backoff_delay(attempts - 1)).await;
            }
        }
    }
}
