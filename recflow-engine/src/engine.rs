//! Pipeline Engine
//!
//! Orchestrates the two write pipelines against the Storage Port and the
//! Plugin Registry, with every run serialized by the Key Serializer.
//!
//! # Entity write (key `"{type}:entity:{id}"`)
//! 1. Load previous entity
//! 2. Entity feature extraction
//! 3. Commit `{id, data, features}` with an empty classification
//! 4. Generic classification, commit classification
//! 5. List related users
//! 6. Fan-out: refresh each related user under its own user key
//! 7. Return the enriched entity
//!
//! Steps 5-6 can run before step 4 (`FanOutOrder::BeforeClassification`).
//!
//! # Relation write (key `"{type}:user:{user_id}"`)
//! 1. Load entity (must exist)
//! 2. Load previous user
//! 3. Commit relation
//! 4. User feature extraction, commit user
//! 5. User classification, commit score
//! 6. Return `{entity, user, data}`
//!
//! # Error Handling
//! - Any failing step aborts the rest of that run; committed steps stay
//! - Errors go to the caller of that write only
//! - Keys are always released (see `key_serializer`)
//!
//! # Lock Order
//! Entity runs take the entity key, then user keys during fan-out. Relation
//! runs take only a user key. Nothing ever takes an entity key while holding
//! a user key.

use crate::error::{PipelineError, Result, Stage};
use crate::key_serializer::KeySerializer;
use crate::registry::{PluginRegistry, ResolvedPlugins};
use crate::storage::Storage;
use crate::types::{
    entity_key, user_key, Classification, Entity, EntityWrite, Relation, RelationOutcome,
    RelationWrite, User,
};
use futures::{StreamExt, TryStreamExt};
use recflow_common::config::{EngineSettings, FanOutOrder};
use recflow_common::events::{EventBus, PipelineEvent, PipelineKind};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for every plugin invocation (unbounded when `None`)
    pub plugin_timeout: Option<Duration>,
    /// Global cap on concurrently running top-level pipelines
    pub max_concurrent_pipelines: Option<usize>,
    /// Related users refreshed concurrently during fan-out (minimum 1)
    pub fan_out_concurrency: usize,
    /// Position of fan-out relative to generic classification
    pub fan_out_order: FanOutOrder,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            plugin_timeout: settings.plugin_timeout_ms.map(Duration::from_millis),
            max_concurrent_pipelines: settings.max_concurrent_pipelines,
            fan_out_concurrency: settings.fan_out_concurrency.max(1),
            fan_out_order: settings.fan_out_order,
        }
    }
}

/// Pipeline engine shared by all ingress streams
pub struct PipelineEngine {
    storage: Arc<dyn Storage>,
    registry: Arc<PluginRegistry>,
    locks: KeySerializer<String>,
    limiter: Option<Semaphore>,
    config: EngineConfig,
    event_bus: Option<EventBus>,
}

impl PipelineEngine {
    /// Create an engine over a storage backend and a populated registry
    pub fn new(storage: Arc<dyn Storage>, registry: PluginRegistry, config: EngineConfig) -> Self {
        let limiter = config
            .max_concurrent_pipelines
            .map(|cap| Semaphore::new(cap.max(1)));

        Self {
            storage,
            registry: Arc::new(registry),
            locks: KeySerializer::new(),
            limiter,
            config,
            event_bus: None,
        }
    }

    /// Publish pipeline progress on an event bus
    pub fn with_events(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-key locks (exposed for diagnostics)
    pub fn key_serializer(&self) -> &KeySerializer<String> {
        &self.locks
    }

    // ========================================================================
    // Read path (no key locks)
    // ========================================================================

    pub async fn entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>> {
        Ok(self.storage.get_entity(entity_type, id).await?)
    }

    pub async fn user(&self, entity_type: &str, user_id: &str) -> Result<Option<User>> {
        Ok(self.storage.get_user(entity_type, user_id).await?)
    }

    pub async fn user_entity_score(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> Result<Option<f64>> {
        Ok(self
            .storage
            .get_user_entity_classification(entity_type, entity_id, user_id)
            .await?)
    }

    // ========================================================================
    // Entity write pipeline
    // ========================================================================

    /// Run the entity write pipeline and return the enriched entity
    pub async fn write_entity(&self, entity_type: &str, write: EntityWrite) -> Result<Entity> {
        let run_id = Uuid::new_v4();
        let key = entity_key(entity_type, &write.id);

        let result = match self.registry.resolve(entity_type) {
            Ok(plugins) => {
                let _permit = self.admit().await;
                self.locks
                    .run_exclusive(key.clone(), || {
                        self.entity_pipeline(run_id, entity_type, &key, &plugins, write)
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.report_failure(run_id, PipelineKind::EntityWrite, entity_type, &key, e);
        }
        result
    }

    async fn entity_pipeline(
        &self,
        run_id: Uuid,
        entity_type: &str,
        key: &str,
        plugins: &ResolvedPlugins,
        write: EntityWrite,
    ) -> Result<Entity> {
        debug!(run_id = %run_id, key, "Entity pipeline started");

        // Step 1: previous record
        let previous = self.storage.get_entity(entity_type, &write.id).await?;

        // Step 2: feature extraction
        let mut entity = Entity::unprocessed(write.id, write.data);
        let stage = Stage::EntityFeatureExtraction;
        let features = self
            .bounded(
                stage,
                key,
                plugins.entity_extractor.extract(&entity, previous.as_ref()),
            )
            .await?
            .map_err(|source| PipelineError::Extraction {
                stage,
                key: key.to_string(),
                source,
            })?;

        // Step 3: commit features before anything user-facing happens
        entity.features = features;
        self.storage.put_entity(entity_type, &entity).await?;
        self.emit(PipelineEvent::EntityCommitted {
            run_id,
            entity_type: entity_type.to_string(),
            entity_id: entity.id.clone(),
            timestamp: chrono::Utc::now(),
        });
        debug!(run_id = %run_id, key, "Entity features committed");

        let related_users = match self.config.fan_out_order {
            FanOutOrder::AfterClassification => {
                self.classify_entity(run_id, entity_type, key, plugins, &mut entity)
                    .await?;
                self.fan_out(run_id, entity_type, plugins, &entity).await?
            }
            FanOutOrder::BeforeClassification => {
                let related = self.fan_out(run_id, entity_type, plugins, &entity).await?;
                self.classify_entity(run_id, entity_type, key, plugins, &mut entity)
                    .await?;
                related
            }
        };

        info!(
            run_id = %run_id,
            entity_type,
            entity_id = %entity.id,
            classifiers = entity.classification.len(),
            related_users,
            "Entity pipeline complete"
        );

        Ok(entity)
    }

    /// Step 4: run every generic classifier and commit the classification
    async fn classify_entity(
        &self,
        run_id: Uuid,
        entity_type: &str,
        key: &str,
        plugins: &ResolvedPlugins,
        entity: &mut Entity,
    ) -> Result<()> {
        let snapshot: &Entity = entity;
        let scoring = plugins.classifiers.iter().map(|(label, classifier)| {
            let entity = snapshot;
            async move {
                let score = self
                    .bounded(
                        Stage::GenericClassification,
                        key,
                        classifier.classify(&entity.id, &entity.data, &entity.features),
                    )
                    .await?
                    .map_err(|e| PipelineError::Classification {
                        label: label.clone(),
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok::<_, PipelineError>((label.clone(), checked_score(label, key, score)?))
            }
        });

        let scores = futures::future::try_join_all(scoring).await?;
        let labels: Vec<String> = scores.iter().map(|(label, _)| label.clone()).collect();
        entity.classification = scores.into_iter().collect::<Classification>();

        self.storage.put_entity(entity_type, entity).await?;
        self.emit(PipelineEvent::EntityClassified {
            run_id,
            entity_type: entity_type.to_string(),
            entity_id: entity.id.clone(),
            labels,
            timestamp: chrono::Utc::now(),
        });
        debug!(run_id = %run_id, key, "Entity classification committed");
        Ok(())
    }

    /// Steps 5-6: refresh every user related to the entity
    ///
    /// Returns the number of related users.
    async fn fan_out(
        &self,
        run_id: Uuid,
        entity_type: &str,
        plugins: &ResolvedPlugins,
        entity: &Entity,
    ) -> Result<usize> {
        let users = self
            .storage
            .list_users_related_to(entity_type, &entity.id)
            .await?;
        let count = users.len();
        if count == 0 {
            return Ok(0);
        }

        debug!(
            run_id = %run_id,
            entity_type,
            entity_id = %entity.id,
            users = count,
            "Fanning out to related users"
        );

        futures::stream::iter(users)
            .map(Ok)
            .try_for_each_concurrent(self.config.fan_out_concurrency, |user_id| {
                self.refresh_user(run_id, entity_type, plugins, entity, user_id)
            })
            .await?;

        Ok(count)
    }

    /// Re-run user extraction and classification for one related user
    async fn refresh_user(
        &self,
        run_id: Uuid,
        entity_type: &str,
        plugins: &ResolvedPlugins,
        entity: &Entity,
        user_id: String,
    ) -> Result<()> {
        let key = user_key(entity_type, &user_id);
        self.locks
            .run_exclusive(key.clone(), || async {
                let relation = self
                    .storage
                    .get_relation(entity_type, &entity.id, &user_id)
                    .await?;
                let Some(relation) = relation else {
                    warn!(
                        run_id = %run_id,
                        entity_type,
                        entity_id = %entity.id,
                        user_id = %user_id,
                        "Related user has no relation record, skipping"
                    );
                    return Ok(());
                };

                let previous = self.storage.get_user(entity_type, &user_id).await?;
                self.update_user(
                    run_id,
                    entity_type,
                    &key,
                    plugins,
                    entity,
                    previous,
                    &user_id,
                    &relation.data,
                    true,
                )
                .await
                .map(|_| ())
            })
            .await
    }

    // ========================================================================
    // Relation write pipeline
    // ========================================================================

    /// Run the relation write pipeline
    pub async fn write_relation(
        &self,
        entity_type: &str,
        write: RelationWrite,
    ) -> Result<RelationOutcome> {
        let run_id = Uuid::new_v4();
        let key = user_key(entity_type, &write.user_id);

        let result = match self.registry.resolve(entity_type) {
            Ok(plugins) => {
                let _permit = self.admit().await;
                self.locks
                    .run_exclusive(key.clone(), || {
                        self.relation_pipeline(run_id, entity_type, &key, &plugins, write)
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.report_failure(run_id, PipelineKind::RelationWrite, entity_type, &key, e);
        }
        result
    }

    async fn relation_pipeline(
        &self,
        run_id: Uuid,
        entity_type: &str,
        key: &str,
        plugins: &ResolvedPlugins,
        write: RelationWrite,
    ) -> Result<RelationOutcome> {
        debug!(run_id = %run_id, key, entity_id = %write.entity_id, "Relation pipeline started");

        // Step 1: entity must exist
        let entity = self
            .storage
            .get_entity(entity_type, &write.entity_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownEntity {
                entity_type: entity_type.to_string(),
                entity_id: write.entity_id.clone(),
            })?;

        // Step 2: previous user
        let previous = self.storage.get_user(entity_type, &write.user_id).await?;

        // Step 3: relation replaces any earlier one for this pair
        let relation = Relation {
            entity_id: write.entity_id,
            user_id: write.user_id,
            data: write.data,
        };
        self.storage.put_relation(entity_type, &relation).await?;
        self.emit(PipelineEvent::RelationCommitted {
            run_id,
            entity_type: entity_type.to_string(),
            entity_id: relation.entity_id.clone(),
            user_id: relation.user_id.clone(),
            timestamp: chrono::Utc::now(),
        });

        // Steps 4-5
        let user = self
            .update_user(
                run_id,
                entity_type,
                key,
                plugins,
                &entity,
                previous,
                &relation.user_id,
                &relation.data,
                false,
            )
            .await?;

        info!(
            run_id = %run_id,
            entity_type,
            entity_id = %entity.id,
            user_id = %user.id,
            "Relation pipeline complete"
        );

        Ok(RelationOutcome {
            entity,
            user,
            data: relation.data,
        })
    }

    /// User feature extraction + user classification, shared by relation
    /// writes and fan-out. Caller holds the user key.
    #[allow(clippy::too_many_arguments)]
    async fn update_user(
        &self,
        run_id: Uuid,
        entity_type: &str,
        key: &str,
        plugins: &ResolvedPlugins,
        entity: &Entity,
        previous: Option<User>,
        user_id: &str,
        relation: &serde_json::Value,
        fan_out: bool,
    ) -> Result<User> {
        let stage = Stage::UserFeatureExtraction;
        let features = self
            .bounded(
                stage,
                key,
                plugins
                    .user_extractor
                    .extract(entity, previous.as_ref(), relation),
            )
            .await?
            .map_err(|source| PipelineError::Extraction {
                stage,
                key: key.to_string(),
                source,
            })?;

        let user = User {
            id: user_id.to_string(),
            features,
        };
        self.storage.put_user(entity_type, &user).await?;

        let label = "user classifier";
        let score = self
            .bounded(
                Stage::UserClassification,
                key,
                plugins
                    .user_classifier
                    .classify(user_id, entity, &user.features),
            )
            .await?
            .map_err(|e| PipelineError::Classification {
                label: label.to_string(),
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        let score = checked_score(label, key, score)?;

        self.storage
            .put_user_entity_classification(entity_type, &entity.id, user_id, score)
            .await?;
        self.emit(PipelineEvent::UserUpdated {
            run_id,
            entity_type: entity_type.to_string(),
            entity_id: entity.id.clone(),
            user_id: user_id.to_string(),
            score,
            fan_out,
            timestamp: chrono::Utc::now(),
        });
        debug!(run_id = %run_id, key, entity_id = %entity.id, score, fan_out, "User updated");

        Ok(user)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Global concurrency cap; taken before queueing on a key
    async fn admit(&self) -> Option<SemaphorePermit<'_>> {
        match &self.limiter {
            // The semaphore is never closed, so acquire cannot fail
            Some(limiter) => limiter.acquire().await.ok(),
            None => None,
        }
    }

    /// Apply the plugin timeout to one invocation
    async fn bounded<T>(&self, stage: Stage, key: &str, call: impl Future<Output = T>) -> Result<T> {
        match self.config.plugin_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| PipelineError::Timeout {
                    stage,
                    key: key.to_string(),
                    after: limit,
                }),
            None => Ok(call.await),
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }

    fn report_failure(
        &self,
        run_id: Uuid,
        kind: PipelineKind,
        entity_type: &str,
        key: &str,
        err: &PipelineError,
    ) {
        if err.is_caller_error() {
            warn!(run_id = %run_id, key, error = %err, "Write rejected");
        } else {
            error!(run_id = %run_id, key, error = %err, "Pipeline failed");
        }
        self.emit(PipelineEvent::PipelineFailed {
            run_id,
            kind,
            entity_type: entity_type.to_string(),
            key: key.to_string(),
            message: err.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Reject scores that cannot be stored or compared
fn checked_score(label: &str, key: &str, score: f64) -> Result<f64> {
    if score.is_finite() {
        Ok(score)
    } else {
        Err(PipelineError::Classification {
            label: label.to_string(),
            key: key.to_string(),
            reason: format!("returned non-finite score {}", score),
        })
    }
}

// ============================================================================
// Write kinds
// ============================================================================

/// A write request the engine knows how to run
///
/// Lets ingress streams stay generic over entity and relation writes.
#[async_trait::async_trait]
pub trait PipelineWrite: Send + 'static {
    type Output: Send + 'static;

    /// Serialization key this write will hold
    fn key(&self, entity_type: &str) -> String;

    async fn execute(self, engine: &PipelineEngine, entity_type: &str) -> Result<Self::Output>;
}

#[async_trait::async_trait]
impl PipelineWrite for EntityWrite {
    type Output = Entity;

    fn key(&self, entity_type: &str) -> String {
        entity_key(entity_type, &self.id)
    }

    async fn execute(self, engine: &PipelineEngine, entity_type: &str) -> Result<Entity> {
        engine.write_entity(entity_type, self).await
    }
}

#[async_trait::async_trait]
impl PipelineWrite for RelationWrite {
    type Output = RelationOutcome;

    fn key(&self, entity_type: &str) -> String {
        user_key(entity_type, &self.user_id)
    }

    async fn execute(self, engine: &PipelineEngine, entity_type: &str) -> Result<RelationOutcome> {
        engine.write_relation(entity_type, self).await
    }
}
