//! Core record and request types
//!
//! Records are plain serde structs so any storage backend can persist them
//! as JSON. `data` payloads and feature maps are opaque to the engine: only
//! plugins interpret them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque feature mapping produced by feature extractors
pub type FeatureMap = serde_json::Map<String, serde_json::Value>;

/// Generic classification: classifier label -> score
pub type Classification = BTreeMap<String, f64>;

// ============================================================================
// Records
// ============================================================================

/// A recommendable item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Caller-supplied payload, replaced wholesale on each write
    pub data: serde_json::Value,
    #[serde(default)]
    pub features: FeatureMap,
    #[serde(default)]
    pub classification: Classification,
}

impl Entity {
    /// Entity as seen by the feature extractor: no features, no classification
    pub fn unprocessed(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            features: FeatureMap::new(),
            classification: Classification::new(),
        }
    }
}

/// A recommendation target, scoped per entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub features: FeatureMap,
}

/// Latest interaction payload between one user and one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub entity_id: String,
    pub user_id: String,
    pub data: serde_json::Value,
}

// ============================================================================
// Write requests and results
// ============================================================================

/// Entity write request for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityWrite {
    pub id: String,
    pub data: serde_json::Value,
}

impl EntityWrite {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self { id: id.into(), data }
    }
}

/// Relation write request for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationWrite {
    pub entity_id: String,
    pub user_id: String,
    pub data: serde_json::Value,
}

impl RelationWrite {
    pub fn new(
        entity_id: impl Into<String>,
        user_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            user_id: user_id.into(),
            data,
        }
    }
}

/// Result of a relation write: the entity classified against, the updated
/// user and the relation payload that was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationOutcome {
    pub entity: Entity,
    pub user: User,
    pub data: serde_json::Value,
}

// ============================================================================
// Serialization keys
// ============================================================================

/// Key serializing every write to one entity
pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:entity:{}", entity_type, entity_id)
}

/// Key serializing every write to one user
pub fn user_key(entity_type: &str, user_id: &str) -> String {
    format!("{}:user:{}", entity_type, user_id)
}
