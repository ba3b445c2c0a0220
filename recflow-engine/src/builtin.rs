//! Built-in numeric plugin set
//!
//! Used by the `recflow` replay tool and as a reference for plugin authors.
//! Works on flat JSON objects whose numeric fields are the features:
//! - `NumericFeatures`: entity features are the numeric fields of `data`
//! - `Magnitude`: euclidean norm of the entity features
//! - `WeightedProfile`: user profile accumulates entity features scaled by
//!   the relation's `weight` (default 1.0)
//! - `CosineAffinity`: cosine similarity between user profile and entity

use crate::error::PluginError;
use crate::registry::{
    EntityFeatureExtractor, GenericClassifier, PluginRegistry, UserClassifier,
    UserFeatureExtractor,
};
use crate::types::{Entity, FeatureMap, User};
use serde_json::Value;

/// Relation field scaling a user's interaction
pub const WEIGHT_FIELD: &str = "weight";

/// Label of the built-in generic classifier
pub const MAGNITUDE_LABEL: &str = "magnitude";

/// Register the full numeric plugin set for `entity_type`
pub fn register_numeric_plugins(registry: &mut PluginRegistry, entity_type: &str) {
    registry
        .register_entity_extractor(entity_type, NumericFeatures)
        .register_classifier(entity_type, MAGNITUDE_LABEL, Magnitude)
        .register_user_extractor(entity_type, WeightedProfile)
        .register_user_classifier(entity_type, CosineAffinity);
}

fn numeric_value(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}

fn feature(features: &FeatureMap, name: &str) -> f64 {
    features.get(name).and_then(numeric_value).unwrap_or(0.0)
}

fn norm(features: &FeatureMap) -> f64 {
    features
        .values()
        .filter_map(numeric_value)
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt()
}

/// Entity features: numeric fields of the payload
pub struct NumericFeatures;

#[async_trait::async_trait]
impl EntityFeatureExtractor for NumericFeatures {
    async fn extract(
        &self,
        entity: &Entity,
        _previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError> {
        let fields = entity.data.as_object().ok_or_else(|| {
            PluginError::InvalidInput(format!("entity '{}' data is not an object", entity.id))
        })?;

        Ok(fields
            .iter()
            .filter(|(_, value)| numeric_value(value).is_some())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect())
    }
}

/// Generic classifier: length of the feature vector
pub struct Magnitude;

#[async_trait::async_trait]
impl GenericClassifier for Magnitude {
    async fn classify(
        &self,
        _id: &str,
        _data: &Value,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        Ok(norm(features))
    }
}

/// User features: running sum of weighted entity features
pub struct WeightedProfile;

#[async_trait::async_trait]
impl UserFeatureExtractor for WeightedProfile {
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&User>,
        relation: &Value,
    ) -> Result<FeatureMap, PluginError> {
        let weight = match relation.get(WEIGHT_FIELD) {
            None | Some(Value::Null) => 1.0,
            Some(value) => numeric_value(value).ok_or_else(|| {
                PluginError::InvalidInput(format!(
                    "relation field '{}' must be a finite number",
                    WEIGHT_FIELD
                ))
            })?,
        };

        let mut profile = previous.map(|user| user.features.clone()).unwrap_or_default();
        for (name, value) in &entity.features {
            let Some(value) = numeric_value(value) else {
                continue;
            };
            let sum = feature(&profile, name) + weight * value;
            let sum = serde_json::Number::from_f64(sum).ok_or_else(|| {
                PluginError::Failed(format!("feature '{}' overflowed", name))
            })?;
            profile.insert(name.clone(), Value::Number(sum));
        }
        Ok(profile)
    }
}

/// User classifier: cosine similarity of profile and entity, 0 when either
/// vector is empty
pub struct CosineAffinity;

#[async_trait::async_trait]
impl UserClassifier for CosineAffinity {
    async fn classify(
        &self,
        _user_id: &str,
        entity: &Entity,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        let denominator = norm(features) * norm(&entity.features);
        if denominator == 0.0 {
            return Ok(0.0);
        }

        let dot: f64 = entity
            .features
            .iter()
            .filter_map(|(name, value)| numeric_value(value).map(|v| v * feature(features, name)))
            .sum();
        Ok(dot / denominator)
    }
}
