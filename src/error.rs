//! Error types for the cross-context synchronization engine.

use crate::types::{ContextId, EntityId, GenerationId};
use thiserror::Error;

/// Shared-store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record revision mismatch: expected {expected}, stored {actual}")]
    RevisionMismatch { expected: u64, actual: u64 },

    #[error("Record serialization failed: {0}")]
    Serialize(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Synchronization and lifecycle errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("Persistence conflict after {attempts} attempts")]
    PersistenceConflict { attempts: usize },

    #[error("Coordinator restarted (observed {observed})")]
    CoordinatorRestarted { observed: GenerationId },

    #[error("No snapshot found for entity {0}")]
    SnapshotMissing(EntityId),

    #[error("Ownership violation on {entity}: owned by {owner}, mutated by {actor}")]
    OwnershipViolation {
        entity: EntityId,
        owner: ContextId,
        actor: ContextId,
    },

    #[error("Message timed out (correlation {correlation_id})")]
    MessageTimeout { correlation_id: u64 },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Stale callback for entity {entity}: {reason}")]
    StaleCallback { entity: EntityId, reason: String },

    #[error("Invalid message payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}
