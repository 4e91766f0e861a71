//! Persisted record codec: the serialized form of the full entity set.
//!
//! The record is a forward-compatible JSON shape; fields this version does
//! not understand are captured in `extra` on read and written back on the
//! next write, never dropped.

use crate::entity::Entity;
use crate::error::StoreError;
use crate::types::{ContextId, EntityId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content fingerprint of a record: blake3 over the entity set and the
/// record revision. Used to drop logically identical re-deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// Serialized form of the full entity set held in the shared store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    /// All known entities, any visibility, ordered by id.
    #[serde(default)]
    pub entities: Vec<Entity>,

    /// Opaque token unique to a single write attempt, for self-write
    /// detection.
    #[serde(default)]
    pub write_id: String,

    /// Monotonic counter for optimistic-concurrency validation.
    #[serde(default)]
    pub revision: u64,

    /// Set only by the destroy path when the write legitimately empties the
    /// writer's entity set.
    #[serde(default)]
    pub intentional_empty: bool,

    /// Fields from newer record versions, preserved across writes.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PersistedRecord {
    /// Content fingerprint over the entity set plus record revision.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut sorted: Vec<&Entity> = self.entities.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.revision.to_le_bytes());
        for entity in sorted {
            hasher.update(entity.id.as_str().as_bytes());
            hasher.update(&entity.owner_context_id.0.to_le_bytes());
            hasher.update(&entity.owner_partition_id.0.to_le_bytes());
            hasher.update(&entity.revision.as_u64().to_le_bytes());
            hasher.update(&entity.geometry.x.to_le_bytes());
            hasher.update(&entity.geometry.y.to_le_bytes());
            hasher.update(&entity.geometry.width.to_le_bytes());
            hasher.update(&entity.geometry.height.to_le_bytes());
            hasher.update(match entity.visibility {
                crate::types::Visibility::Visible => b"v",
                crate::types::Visibility::Minimized => b"m",
            });
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }

    /// Build the successor record for an owner-scoped write: the writer's
    /// entities replace its previous ones, every foreign entity in `self`
    /// carries over untouched, and unknown fields are preserved.
    pub fn merge_owned(
        &self,
        owner: ContextId,
        owned: Vec<Entity>,
        write_id: String,
        intentional_empty: bool,
    ) -> PersistedRecord {
        let mut entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.owner_context_id != owner)
            .cloned()
            .collect();
        entities.extend(owned);
        entities.sort_by(|a, b| a.id.cmp(&b.id));

        PersistedRecord {
            entities,
            write_id,
            revision: self.revision + 1,
            intentional_empty,
            extra: self.extra.clone(),
        }
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entity(id).is_some()
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialize(e.to_string()))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialize(e.to_string()))
    }
}
