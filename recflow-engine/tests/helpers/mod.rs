//! Test Helper Utilities
//!
//! Shared fixtures for recflow-engine integration tests

#![allow(dead_code)]

pub mod log_capture;
pub mod plugins;

pub use log_capture::{init_test_logging, LogCapture};
pub use plugins::{
    CopyData, PanicOn, PlaysAffinity, PlaysRelevance, Recorder, RelationFeatures, Stall, UserCall,
    Window,
};

use recflow_engine::storage::{MemoryStorage, Storage, StorageResult};
use recflow_engine::{
    EngineConfig, Entity, PipelineEngine, PluginRegistry, Relation, StorageError, User,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SONG: &str = "song";

/// Entity payload with a play count
pub fn song(plays: u64) -> Value {
    json!({ "plays": plays })
}

/// Relation payload for `user` with a play count
pub fn plays(user: &str, plays: u64) -> Value {
    json!({ "user": user, "plays": plays })
}

/// Complete instrumented plugin set for `SONG`
pub fn song_registry(recorder: &Arc<Recorder>) -> PluginRegistry {
    song_registry_with_delays(recorder, Duration::ZERO, Duration::ZERO)
}

/// Same plugins, with entity and user extraction held open for a while
pub fn song_registry_with_delays(
    recorder: &Arc<Recorder>,
    entity_delay: Duration,
    user_delay: Duration,
) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register_entity_extractor(
            SONG,
            CopyData {
                recorder: Arc::clone(recorder),
                delay: entity_delay,
            },
        )
        .register_classifier(
            SONG,
            "relevance",
            PlaysRelevance {
                recorder: Arc::clone(recorder),
            },
        )
        .register_user_extractor(
            SONG,
            RelationFeatures {
                recorder: Arc::clone(recorder),
                delay: user_delay,
            },
        )
        .register_user_classifier(
            SONG,
            PlaysAffinity {
                recorder: Arc::clone(recorder),
            },
        );
    registry
}

/// Engine over a fresh in-memory backend
pub fn memory_engine(
    registry: PluginRegistry,
    config: EngineConfig,
) -> (Arc<MemoryStorage>, Arc<PipelineEngine>) {
    let storage = Arc::new(MemoryStorage::new());
    let engine = PipelineEngine::new(storage.clone(), registry, config);
    (storage, Arc::new(engine))
}

/// Largest number of windows open at the same instant
pub fn max_overlap(windows: &[Window]) -> usize {
    let mut edges: Vec<(std::time::Instant, i32)> = windows
        .iter()
        .flat_map(|w| [(w.start, 1), (w.end, -1)])
        .collect();
    // Ends sort before starts at the same instant
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let (mut open, mut max) = (0i32, 0i32);
    for (_, delta) in edges {
        open += delta;
        max = max.max(open);
    }
    max as usize
}

/// Memory backend with injectable faults
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    /// Fail every `put_user`
    pub fail_user_writes: AtomicBool,
    /// Extra user reported as related to every entity, without a relation row
    pub phantom_user: Mutex<Option<String>>,
}

#[async_trait::async_trait]
impl Storage for FaultyStorage {
    async fn get_entity(&self, entity_type: &str, id: &str) -> StorageResult<Option<Entity>> {
        self.inner.get_entity(entity_type, id).await
    }

    async fn put_entity(&self, entity_type: &str, entity: &Entity) -> StorageResult<()> {
        self.inner.put_entity(entity_type, entity).await
    }

    async fn list_users_related_to(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<String>> {
        let mut users = self.inner.list_users_related_to(entity_type, entity_id).await?;
        if let Some(phantom) = self.phantom_user.lock().unwrap().clone() {
            users.push(phantom);
        }
        Ok(users)
    }

    async fn get_user(&self, entity_type: &str, user_id: &str) -> StorageResult<Option<User>> {
        self.inner.get_user(entity_type, user_id).await
    }

    async fn put_user(&self, entity_type: &str, user: &User) -> StorageResult<()> {
        if self.fail_user_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("user table unavailable".to_string()));
        }
        self.inner.put_user(entity_type, user).await
    }

    async fn get_relation(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<Relation>> {
        self.inner.get_relation(entity_type, entity_id, user_id).await
    }

    async fn put_relation(&self, entity_type: &str, relation: &Relation) -> StorageResult<()> {
        self.inner.put_relation(entity_type, relation).await
    }

    async fn put_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        score: f64,
    ) -> StorageResult<()> {
        self.inner
            .put_user_entity_classification(entity_type, entity_id, user_id, score)
            .await
    }

    async fn get_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<f64>> {
        self.inner
            .get_user_entity_classification(entity_type, entity_id, user_id)
            .await
    }
}
