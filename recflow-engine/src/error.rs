//! Error types for recflow-engine
//!
//! Every pipeline failure is delivered to the caller of the write that
//! caused it. None of these errors is fatal to the engine itself.

use std::time::Duration;
use thiserror::Error;

/// Convenience Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline stage names, used in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EntityFeatureExtraction,
    GenericClassification,
    UserFeatureExtraction,
    UserClassification,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::EntityFeatureExtraction => "entity feature extraction",
            Stage::GenericClassification => "generic classification",
            Stage::UserFeatureExtraction => "user feature extraction",
            Stage::UserClassification => "user classification",
        };
        f.write_str(name)
    }
}

/// Error returned by plugin implementations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PluginError {
    /// Plugin rejected its input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Plugin failed for another reason
    #[error("Plugin failed: {0}")]
    Failed(String),
}

/// Storage Port failure
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQL backend error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Pipeline error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required plugin is not registered for the entity type
    #[error("Configuration error: no {plugin} registered for entity type '{entity_type}'")]
    Configuration {
        entity_type: String,
        plugin: &'static str,
    },

    /// Relation references an entity that was never written
    #[error("Unknown entity '{entity_id}' of type '{entity_type}'")]
    UnknownEntity {
        entity_type: String,
        entity_id: String,
    },

    /// A feature extractor failed
    #[error("Extraction error during {stage} for {key}: {source}")]
    Extraction {
        stage: Stage,
        key: String,
        #[source]
        source: PluginError,
    },

    /// A classifier failed or produced an unusable score
    #[error("Classification error in '{label}' for {key}: {reason}")]
    Classification {
        label: String,
        key: String,
        reason: String,
    },

    /// A plugin invocation exceeded the configured timeout
    #[error("Timed out after {after:?} during {stage} for {key}")]
    Timeout {
        stage: Stage,
        key: String,
        after: Duration,
    },

    /// Storage Port call failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A plugin panicked while the write was running
    #[error("Pipeline panicked for {key}")]
    Panicked { key: String },

    /// Ingress stream is no longer accepting or delivering results
    #[error("Ingress stream closed")]
    IngressClosed,
}

impl PipelineError {
    /// True for errors caused by the write itself rather than the environment
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PipelineError::UnknownEntity { .. }
                | PipelineError::Extraction {
                    source: PluginError::InvalidInput(_),
                    ..
                }
        )
    }
}
