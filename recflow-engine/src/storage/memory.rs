//! In-memory Storage Port implementation
//!
//! Reference backend used by tests and by the replay tool when no database
//! is configured. Each table sits behind its own `RwLock`, so readers of
//! one table never wait on writers of another.

use super::{Storage, StorageResult};
use crate::types::{Entity, Relation, User};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// (entity type, record id)
type ScopedId = (String, String);

/// Process-local storage backend
#[derive(Default)]
pub struct MemoryStorage {
    entities: RwLock<HashMap<ScopedId, Entity>>,
    users: RwLock<HashMap<ScopedId, User>>,
    /// (type, entity id) -> user id -> relation
    relations: RwLock<HashMap<ScopedId, BTreeMap<String, Relation>>>,
    /// (type, entity id) -> user id -> score
    scores: RwLock<HashMap<ScopedId, BTreeMap<String, f64>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities across all types
    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Number of stored users across all types
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

fn scoped(entity_type: &str, id: &str) -> ScopedId {
    (entity_type.to_string(), id.to_string())
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn get_entity(&self, entity_type: &str, id: &str) -> StorageResult<Option<Entity>> {
        Ok(self.entities.read().await.get(&scoped(entity_type, id)).cloned())
    }

    async fn put_entity(&self, entity_type: &str, entity: &Entity) -> StorageResult<()> {
        self.entities
            .write()
            .await
            .insert(scoped(entity_type, &entity.id), entity.clone());
        Ok(())
    }

    async fn list_users_related_to(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<String>> {
        Ok(self
            .relations
            .read()
            .await
            .get(&scoped(entity_type, entity_id))
            .map(|by_user| by_user.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_user(&self, entity_type: &str, user_id: &str) -> StorageResult<Option<User>> {
        Ok(self.users.read().await.get(&scoped(entity_type, user_id)).cloned())
    }

    async fn put_user(&self, entity_type: &str, user: &User) -> StorageResult<()> {
        self.users
            .write()
            .await
            .insert(scoped(entity_type, &user.id), user.clone());
        Ok(())
    }

    async fn get_relation(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<Relation>> {
        Ok(self
            .relations
            .read()
            .await
            .get(&scoped(entity_type, entity_id))
            .and_then(|by_user| by_user.get(user_id))
            .cloned())
    }

    async fn put_relation(&self, entity_type: &str, relation: &Relation) -> StorageResult<()> {
        self.relations
            .write()
            .await
            .entry(scoped(entity_type, &relation.entity_id))
            .or_default()
            .insert(relation.user_id.clone(), relation.clone());
        Ok(())
    }

    async fn put_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        score: f64,
    ) -> StorageResult<()> {
        self.scores
            .write()
            .await
            .entry(scoped(entity_type, entity_id))
            .or_default()
            .insert(user_id.to_string(), score);
        Ok(())
    }

    async fn get_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<f64>> {
        Ok(self
            .scores
            .read()
            .await
            .get(&scoped(entity_type, entity_id))
            .and_then(|by_user| by_user.get(user_id))
            .copied())
    }
}
