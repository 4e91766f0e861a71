//! Privileged coordinator and its liveness management.
//!
//! The coordinator assigns context identities, keeps an authoritative entity
//! cache, and relays entity updates to every other known context as the
//! low-latency propagation path. Its host may recycle it at any time: every
//! (re)start bumps the generation id, every response carries the current
//! generation, and any client observing a generation change discards
//! in-flight state and renegotiates rather than treating silence as success.

use crate::channel::{next_correlation_id, Envelope, Payload};
use crate::config::SyncConfig;
use crate::entity::Entity;
use crate::error::SyncError;
use crate::types::{ContextId, EntityId, GenerationId, PartitionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct CoordinatorInner {
    partition: PartitionId,
    generation: AtomicU64,
    next_context: AtomicU32,
    /// When paused the coordinator services nothing; requests time out.
    paused: AtomicBool,
    inboxes: Mutex<HashMap<ContextId, mpsc::UnboundedSender<Envelope>>>,
    cache: Mutex<HashMap<EntityId, Entity>>,
}

impl CoordinatorInner {
    fn generation(&self) -> GenerationId {
        GenerationId(self.generation.load(Ordering::SeqCst))
    }

    fn process(&self, payload: Payload) -> Result<Payload, SyncError> {
        payload.validate()?;
        match payload {
            Payload::IdentityRequest { reclaim } => {
                let context_id = match reclaim {
                    Some(id) => {
                        // Keep the allocator ahead of reclaimed ids.
                        self.next_context.fetch_max(id.0 + 1, Ordering::SeqCst);
                        id
                    }
                    None => ContextId(self.next_context.fetch_add(1, Ordering::SeqCst)),
                };
                debug!(%context_id, "identity assigned");
                Ok(Payload::IdentityResponse {
                    context_id,
                    partition_id: self.partition,
                })
            }
            Payload::Heartbeat { .. } => Ok(Payload::HeartbeatAck),
            Payload::EntityUpdate { entity } => {
                let origin = entity.owner_context_id;
                self.cache.lock().insert(entity.id.clone(), entity.clone());
                self.fan_out(origin, Payload::EntityUpdate { entity });
                Ok(Payload::Ack)
            }
            Payload::GeometryChangeEnd { actor, .. } => {
                // Relayed to the owning context by fan-out; the coordinator
                // never applies geometry itself.
                self.fan_out(actor, payload);
                Ok(Payload::Ack)
            }
            other => Err(SyncError::InvalidPayload(format!(
                "coordinator cannot service {:?}",
                other
            ))),
        }
    }

    /// Best-effort delivery to every registered context except the origin.
    /// A dead inbox is dropped; that context falls back to the store-change
    /// path, which remains the path of record.
    fn fan_out(&self, origin: ContextId, payload: Payload) {
        let generation = self.generation();
        let mut inboxes = self.inboxes.lock();
        inboxes.retain(|ctx, sender| {
            if *ctx == origin {
                return true;
            }
            let envelope = Envelope::new(payload.clone()).with_generation(generation);
            if sender.send(envelope).is_err() {
                debug!(context = %ctx, "dropping dead inbox; store path will cover it");
                false
            } else {
                true
            }
        });
    }
}

/// Handle to the in-process coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                partition,
                generation: AtomicU64::new(1),
                next_context: AtomicU32::new(1),
                paused: AtomicBool::new(false),
                inboxes: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn generation(&self) -> GenerationId {
        self.inner.generation()
    }

    /// Simulate the host recycling the coordinator: bump the generation and
    /// drop all transient state (registrations, cache).
    pub fn restart(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.inboxes.lock().clear();
        self.inner.cache.lock().clear();
        info!(generation, "coordinator restarted");
    }

    /// Simulate unresponsiveness: requests time out until `resume`.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    pub fn cached_entities(&self) -> Vec<Entity> {
        self.inner.cache.lock().values().cloned().collect()
    }

    pub fn client(&self, cfg: SyncConfig) -> CoordinatorClient {
        CoordinatorClient {
            inner: self.inner.clone(),
            cfg,
            last_generation: Mutex::new(None),
        }
    }
}

/// One context's link to the coordinator.
///
/// Every request carries a correlation id and an explicit timeout. A
/// response whose generation differs from the last observed one surfaces as
/// `CoordinatorRestarted` exactly once; the new generation is adopted so the
/// caller's retry proceeds against it.
pub struct CoordinatorClient {
    inner: Arc<CoordinatorInner>,
    cfg: SyncConfig,
    last_generation: Mutex<Option<GenerationId>>,
}

impl CoordinatorClient {
    async fn call(&self, payload: Payload) -> Result<Envelope, SyncError> {
        let correlation_id = next_correlation_id();
        if self.inner.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(self.cfg.request_timeout()).await;
            return Err(SyncError::MessageTimeout { correlation_id });
        }
        let generation = self.inner.generation();
        let response = self.inner.process(payload)?;
        self.observe_generation(generation)?;
        Ok(Envelope {
            correlation_id,
            sent_at: chrono::Utc::now(),
            sequence_id: None,
            generation: Some(generation),
            payload: response,
        })
    }

    fn observe_generation(&self, generation: GenerationId) -> Result<(), SyncError> {
        let mut last = self.last_generation.lock();
        match *last {
            Some(seen) if seen != generation => {
                *last = Some(generation);
                warn!(old = %seen, new = %generation, "coordinator generation changed");
                Err(SyncError::CoordinatorRestarted {
                    observed: generation,
                })
            }
            _ => {
                *last = Some(generation);
                Ok(())
            }
        }
    }

    pub fn last_generation(&self) -> Option<GenerationId> {
        *self.last_generation.lock()
    }

    /// Request (or reclaim) a context identity.
    pub async fn request_identity(
        &self,
        reclaim: Option<ContextId>,
    ) -> Result<(ContextId, PartitionId), SyncError> {
        let response = self.call(Payload::IdentityRequest { reclaim }).await?;
        match response.payload {
            Payload::IdentityResponse {
                context_id,
                partition_id,
            } => Ok((context_id, partition_id)),
            other => Err(SyncError::InvalidPayload(format!(
                "unexpected identity response: {:?}",
                other
            ))),
        }
    }

    /// Register this context's direct-message inbox for fan-out.
    pub fn register_inbox(&self, context: ContextId, sender: mpsc::UnboundedSender<Envelope>) {
        self.inner.inboxes.lock().insert(context, sender);
    }

    /// Push an entity update through the low-latency path. Best effort; the
    /// caller never depends on it for correctness.
    pub async fn publish_update(&self, entity: Entity) -> Result<(), SyncError> {
        self.call(Payload::EntityUpdate { entity }).await.map(|_| ())
    }

    /// Liveness probe. Returns the coordinator's current generation.
    pub async fn heartbeat(&self, from: ContextId) -> Result<GenerationId, SyncError> {
        let response = self.call(Payload::Heartbeat { from }).await?;
        response
            .generation
            .ok_or_else(|| SyncError::InvalidPayload("heartbeat ack without generation".into()))
    }
}

/// Heartbeat miss accounting for one context's view of the coordinator.
#[derive(Debug)]
pub struct LivenessTracker {
    threshold: u32,
    misses: u32,
    degraded: bool,
}

/// What the prober should do after recording a probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Healthy,
    /// Missed, but below the escalation threshold.
    Wait,
    /// Threshold reached: attempt reconnection with bounded backoff.
    Reconnect,
}

impl LivenessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            misses: 0,
            degraded: false,
        }
    }

    pub fn record_success(&mut self) -> LivenessAction {
        self.misses = 0;
        self.degraded = false;
        LivenessAction::Healthy
    }

    pub fn record_miss(&mut self) -> LivenessAction {
        self.misses += 1;
        if self.misses >= self.threshold {
            LivenessAction::Reconnect
        } else {
            LivenessAction::Wait
        }
    }

    /// Entered when reconnection keeps failing. Cleared by the next
    /// successful probe.
    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }
}
