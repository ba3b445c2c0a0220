//! Instrumented plugins
//!
//! Every plugin reports to a shared `Recorder`: call counters, the order of
//! pipeline steps, and start/end windows for mutual exclusion checks.

use recflow_engine::{
    Entity, EntityFeatureExtractor, GenericClassifier, PluginError, User, UserClassifier,
    UserFeatureExtractor,
};
use recflow_engine::types::FeatureMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Execution window of one plugin call
#[derive(Debug, Clone)]
pub struct Window {
    pub key: String,
    pub start: Instant,
    pub end: Instant,
}

/// One user feature extraction, with the entity version it saw
#[derive(Debug, Clone, PartialEq)]
pub struct UserCall {
    pub user_id: String,
    pub entity_id: String,
    pub entity_plays: f64,
}

#[derive(Default)]
pub struct Recorder {
    pub entity_extractions: AtomicUsize,
    pub classifications: AtomicUsize,
    pub user_extractions: AtomicUsize,
    pub user_classifications: AtomicUsize,
    steps: Mutex<Vec<String>>,
    windows: Mutex<Vec<Window>>,
    user_calls: Mutex<Vec<UserCall>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Step log such as `extract:s1`, `classify:s1`, `user_extract:u1`
    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }

    pub fn windows(&self, key: &str) -> Vec<Window> {
        self.windows
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.key == key)
            .cloned()
            .collect()
    }

    pub fn all_windows(&self) -> Vec<Window> {
        self.windows.lock().unwrap().clone()
    }

    pub fn user_calls(&self) -> Vec<UserCall> {
        self.user_calls.lock().unwrap().clone()
    }

    /// Forget everything recorded so far
    pub fn reset(&self) {
        self.entity_extractions.store(0, Ordering::SeqCst);
        self.classifications.store(0, Ordering::SeqCst);
        self.user_extractions.store(0, Ordering::SeqCst);
        self.user_classifications.store(0, Ordering::SeqCst);
        self.steps.lock().unwrap().clear();
        self.windows.lock().unwrap().clear();
        self.user_calls.lock().unwrap().clear();
    }

    fn step(&self, step: String) {
        self.steps.lock().unwrap().push(step);
    }

    /// Hold a window open for `delay`
    async fn timed(&self, key: String, delay: Duration) {
        let start = Instant::now();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.windows.lock().unwrap().push(Window {
            key,
            start,
            end: Instant::now(),
        });
    }
}

fn plays(features: &FeatureMap) -> f64 {
    features.get("plays").and_then(Value::as_f64).unwrap_or(0.0)
}

/// Entity features = the object payload
pub struct CopyData {
    pub recorder: Arc<Recorder>,
    pub delay: Duration,
}

#[async_trait::async_trait]
impl EntityFeatureExtractor for CopyData {
    async fn extract(
        &self,
        entity: &Entity,
        _previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError> {
        self.recorder.entity_extractions.fetch_add(1, Ordering::SeqCst);
        self.recorder.step(format!("extract:{}", entity.id));
        self.recorder
            .timed(format!("entity:{}", entity.id), self.delay)
            .await;

        entity
            .data
            .as_object()
            .cloned()
            .ok_or_else(|| PluginError::InvalidInput("entity data must be an object".to_string()))
    }
}

/// `relevance` = the `plays` feature
pub struct PlaysRelevance {
    pub recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl GenericClassifier for PlaysRelevance {
    async fn classify(
        &self,
        id: &str,
        _data: &Value,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        self.recorder.classifications.fetch_add(1, Ordering::SeqCst);
        self.recorder.step(format!("classify:{}", id));
        Ok(plays(features))
    }
}

/// User features = the relation payload
///
/// Relation payloads carry their user id under `user` (see
/// `helpers::plays`), since extractors are not told which user they serve.
pub struct RelationFeatures {
    pub recorder: Arc<Recorder>,
    pub delay: Duration,
}

#[async_trait::async_trait]
impl UserFeatureExtractor for RelationFeatures {
    async fn extract(
        &self,
        entity: &Entity,
        previous: Option<&User>,
        relation: &Value,
    ) -> Result<FeatureMap, PluginError> {
        let user_id = relation
            .get("user")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| previous.map(|u| u.id.clone()))
            .unwrap_or_default();

        self.recorder.user_extractions.fetch_add(1, Ordering::SeqCst);
        self.recorder.step(format!("user_extract:{}", user_id));
        self.recorder.user_calls.lock().unwrap().push(UserCall {
            user_id: user_id.clone(),
            entity_id: entity.id.clone(),
            entity_plays: plays(&entity.features),
        });
        self.recorder.timed(format!("user:{}", user_id), self.delay).await;

        relation
            .as_object()
            .cloned()
            .ok_or_else(|| PluginError::InvalidInput("relation data must be an object".to_string()))
    }
}

/// Score = user plays scaled by entity plays / 10
pub struct PlaysAffinity {
    pub recorder: Arc<Recorder>,
}

#[async_trait::async_trait]
impl UserClassifier for PlaysAffinity {
    async fn classify(
        &self,
        user_id: &str,
        entity: &Entity,
        features: &FeatureMap,
    ) -> Result<f64, PluginError> {
        self.recorder.user_classifications.fetch_add(1, Ordering::SeqCst);
        self.recorder.step(format!("user_classify:{}", user_id));
        Ok(plays(features) * plays(&entity.features) / 10.0)
    }
}

/// Entity extractor that never finishes in time
pub struct Stall(pub Duration);

#[async_trait::async_trait]
impl EntityFeatureExtractor for Stall {
    async fn extract(
        &self,
        _entity: &Entity,
        _previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError> {
        tokio::time::sleep(self.0).await;
        Ok(FeatureMap::new())
    }
}

/// Entity extractor that panics on one id and copies the payload otherwise
pub struct PanicOn(pub &'static str);

#[async_trait::async_trait]
impl EntityFeatureExtractor for PanicOn {
    async fn extract(
        &self,
        entity: &Entity,
        _previous: Option<&Entity>,
    ) -> Result<FeatureMap, PluginError> {
        if entity.id == self.0 {
            panic!("extractor blew up on {}", entity.id);
        }
        Ok(entity.data.as_object().cloned().unwrap_or_default())
    }
}
