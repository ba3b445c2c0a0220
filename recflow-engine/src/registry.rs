//! Plugin traits and per-entity-type Plugin Registry
//!
//! Each entity type registers:
//! - one entity feature extractor (required)
//! - one user feature extractor (required)
//! - zero or more labeled generic classifiers, kept in registration order
//! - one user classifier (required)
//!
//! The registry is populated at configuration time and shared read-only
//! (behind an `Arc`) once the engine starts.
//!
//! # Example
//! ```rust,ignore
//! let mut registry = PluginRegistry::new();
//! registry
//!     .register_entity_extractor("song", |entity: &Entity, _prev: Option<&Entity>| {
//!         Ok(entity.data.as_object().cloned().unwrap_or_default())
//!     })
//!     .register_classifier("song", "relevance", RelevanceClassifier)
//!     .register_user_extractor("song", MergePlays)
//!     .register_user_classifier("song", PlaysAffinity);
//! registry.validate()?;
//! ```

use crate::error::{PipelineError, PluginError};
use crate::types::{Entity, FeatureMap, User};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Plugin traits
// ============================================================================

/// Derives entity features from raw data and the previous record
#[async_trait::async_trait]
pub trait EntityFeatureExtractor: Send + Sync {
    /// `entity` carries the new data with empty features; `previous` is the
    /// last committed record, if any.
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError>;
}

/// Derives (or merges) user features from a relation payload
#[async_trait::async_trait]
pub trait UserFeatureExtractor: Send + Sync {
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&User>,
        relation: &serde_json::Value,
    ) -> Result<FeatureMap, PluginError>;
}

/// Scores an entity independently of any user
#[async_trait::async_trait]
pub trait GenericClassifier: Send + Sync {
    async fn classify(
        &self,
        id: &str,
        data: &serde_json::Value,
        features: &FeatureMap,
    ) -> Result<f64, PluginError>;
}

/// Scores a user's affinity to an entity from the user's features
#[async_trait::async_trait]
pub trait UserClassifier: Send + Sync {
    async fn classify(
        &self,
        user_id: &str,
        entity: &Entity,
        features: &FeatureMap,
    ) -> Result<f64, PluginError>;
}

// Synchronous closures are plugins too.

#[async_trait::async_trait]
impl<F> EntityFeatureExtractor for F
where
    F: Fn(&Entity, Option<&Entity>) -> Result<FeatureMap, PluginError> + Send + Sync + 'static,
{
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError> {
        self(entity, previous)
    }
}

#[async_trait::async_trait]
impl<F> UserFeatureExtractor for F
where
    F: Fn(&Entity, Option<&User>, &serde_json::Value) -> Result<FeatureMap, PluginError>
        + Send
        + Sync
        + 'static,
{
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&User>,
        relation: &serde_json::Value,
    ) -> Result<FeatureMap, PluginError> {
        self(entity, previous, relation)
    }
}

#[async_trait::async_trait]
impl<F> GenericClassifier for F
where
    F: Fn(&str, &serde_json::Value, &FeatureMap) -> Result<f64, PluginError>
        + Send
        + Sync
        + 'static,
{
    async fn classify(
        &self,
        id: &str,
        data: &serde_json::Value,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        self(id, data, features)
    }
}

#[async_trait::async_trait]
impl<F> UserClassifier for F
where
    F: Fn(&str, &Entity, &FeatureMap) -> Result<f64, PluginError> + Send + Sync + 'static,
{
    async fn classify(
        &self,
        user_id: &str,
        entity: &Entity,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        self(user_id, entity, features)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Plugins registered for one entity type
#[derive(Clone, Default)]
pub struct PluginSet {
    entity_extractor: Option<Arc<dyn EntityFeatureExtractor>>,
    user_extractor: Option<Arc<dyn UserFeatureExtractor>>,
    classifiers: Vec<(String, Arc<dyn GenericClassifier>)>,
    user_classifier: Option<Arc<dyn UserClassifier>>,
}

impl PluginSet {
    /// Labels of registered generic classifiers, in registration order
    pub fn classifier_labels(&self) -> Vec<String> {
        self.classifiers.iter().map(|(label, _)| label.clone()).collect()
    }
}

/// Complete plugin set for a type, every required plugin present
#[derive(Clone)]
pub struct ResolvedPlugins {
    pub entity_extractor: Arc<dyn EntityFeatureExtractor>,
    pub user_extractor: Arc<dyn UserFeatureExtractor>,
    pub classifiers: Vec<(String, Arc<dyn GenericClassifier>)>,
    pub user_classifier: Arc<dyn UserClassifier>,
}

/// Per-entity-type plugin lookup table
#[derive(Clone, Default)]
pub struct PluginRegistry {
    types: HashMap<String, PluginSet>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_mut(&mut self, entity_type: &str) -> &mut PluginSet {
        self.types.entry(entity_type.to_string()).or_default()
    }

    /// Register (or replace) the entity feature extractor for a type
    pub fn register_entity_extractor(
        &mut self,
        entity_type: &str,
        extractor: impl EntityFeatureExtractor + 'static,
    ) -> &mut Self {
        self.set_mut(entity_type).entity_extractor = Some(Arc::new(extractor));
        self
    }

    /// Register (or replace) the user feature extractor for a type
    pub fn register_user_extractor(
        &mut self,
        entity_type: &str,
        extractor: impl UserFeatureExtractor + 'static,
    ) -> &mut Self {
        self.set_mut(entity_type).user_extractor = Some(Arc::new(extractor));
        self
    }

    /// Register a labeled generic classifier
    ///
    /// Re-registering a label replaces that classifier in its original
    /// position.
    pub fn register_classifier(
        &mut self,
        entity_type: &str,
        label: impl Into<String>,
        classifier: impl GenericClassifier + 'static,
    ) -> &mut Self {
        let label = label.into();
        let classifier: Arc<dyn GenericClassifier> = Arc::new(classifier);
        let set = self.set_mut(entity_type);
        match set.classifiers.iter_mut().find(|(existing, _)| *existing == label) {
            Some(slot) => slot.1 = classifier,
            None => set.classifiers.push((label, classifier)),
        }
        self
    }

    /// Register (or replace) the user classifier for a type
    pub fn register_user_classifier(
        &mut self,
        entity_type: &str,
        classifier: impl UserClassifier + 'static,
    ) -> &mut Self {
        self.set_mut(entity_type).user_classifier = Some(Arc::new(classifier));
        self
    }

    /// Registered entity types (sorted)
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }

    /// Plugin set for a type, if anything was registered
    pub fn plugins(&self, entity_type: &str) -> Option<&PluginSet> {
        self.types.get(entity_type)
    }

    /// Look up every plugin a pipeline for `entity_type` needs
    ///
    /// Fails with `PipelineError::Configuration` naming the first missing
    /// required plugin. An empty classifier list is fine.
    pub fn resolve(&self, entity_type: &str) -> Result<ResolvedPlugins, PipelineError> {
        let missing = |plugin: &'static str| PipelineError::Configuration {
            entity_type: entity_type.to_string(),
            plugin,
        };

        let set = self
            .types
            .get(entity_type)
            .ok_or_else(|| missing("entity feature extractor"))?;

        Ok(ResolvedPlugins {
            entity_extractor: set
                .entity_extractor
                .clone()
                .ok_or_else(|| missing("entity feature extractor"))?,
            user_extractor: set
                .user_extractor
                .clone()
                .ok_or_else(|| missing("user feature extractor"))?,
            classifiers: set.classifiers.clone(),
            user_classifier: set
                .user_classifier
                .clone()
                .ok_or_else(|| missing("user classifier"))?,
        })
    }

    /// Check one entity type eagerly
    pub fn validate_type(&self, entity_type: &str) -> Result<(), PipelineError> {
        self.resolve(entity_type).map(|_| ())
    }

    /// Check every registered type; run at startup before accepting traffic
    pub fn validate(&self) -> Result<(), PipelineError> {
        for entity_type in self.entity_types() {
            self.validate_type(&entity_type)?;
        }
        Ok(())
    }
}
