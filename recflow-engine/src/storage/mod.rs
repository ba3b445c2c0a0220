//! Storage Port
//!
//! Abstract data access used by the pipeline engine. Backends must allow
//! concurrent calls for independent keys; the engine serializes calls that
//! touch the same entity or user, so backends need no per-record locking.
//!
//! Two backends ship with the crate:
//! - [`MemoryStorage`]: process-local maps (reference implementation)
//! - [`SqliteStorage`]: SQLite database via sqlx

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use crate::types::{Entity, Relation, User};

/// Result type for Storage Port calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage Port contract
///
/// Every call is scoped by entity type. Writes replace the whole record.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Load an entity, `None` if it was never written
    async fn get_entity(&self, entity_type: &str, id: &str) -> StorageResult<Option<Entity>>;

    /// Insert or replace an entity
    async fn put_entity(&self, entity_type: &str, entity: &Entity) -> StorageResult<()>;

    /// Users holding a relation to the entity
    async fn list_users_related_to(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<String>>;

    /// Load a user, `None` if it was never written
    async fn get_user(&self, entity_type: &str, user_id: &str) -> StorageResult<Option<User>>;

    /// Insert or replace a user
    async fn put_user(&self, entity_type: &str, user: &User) -> StorageResult<()>;

    /// Load the relation for an (entity, user) pair
    async fn get_relation(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<Relation>>;

    /// Insert or replace the relation for its (entity, user) pair
    async fn put_relation(&self, entity_type: &str, relation: &Relation) -> StorageResult<()>;

    /// Record a user's affinity score for an entity
    async fn put_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        score: f64,
    ) -> StorageResult<()>;

    /// Read back a user's affinity score for an entity
    async fn get_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<f64>>;
}
