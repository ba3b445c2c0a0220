//! recflow-engine library interface
//!
//! Pipeline engine for entity and relation writes: feature extraction and
//! classification plugins run against a pluggable storage backend, with
//! every write serialized per entity or per user.
//!
//! ```rust,ignore
//! let mut registry = PluginRegistry::new();
//! builtin::register_numeric_plugins(&mut registry, "song");
//!
//! let engine = Arc::new(PipelineEngine::new(
//!     Arc::new(MemoryStorage::new()),
//!     registry,
//!     EngineConfig::default(),
//! ));
//!
//! let song = engine
//!     .write_entity("song", EntityWrite::new("s1", json!({"tempo": 120})))
//!     .await?;
//! ```

pub mod builtin;
pub mod engine;
pub mod error;
pub mod ingress;
pub mod key_serializer;
pub mod registry;
pub mod storage;
pub mod types;

pub use crate::engine::{EngineConfig, PipelineEngine, PipelineWrite};
pub use crate::error::{PipelineError, PluginError, Result, Stage, StorageError};
pub use crate::ingress::{Completed, Ingress, IngressConfig, IngressHandle, IngressOutput};
pub use crate::key_serializer::{KeyGuard, KeySerializer};
pub use crate::registry::{
    EntityFeatureExtractor, GenericClassifier, PluginRegistry, UserClassifier,
    UserFeatureExtractor,
};
pub use crate::storage::{MemoryStorage, SqliteStorage, Storage};
pub use crate::types::{Entity, EntityWrite, Relation, RelationOutcome, RelationWrite, User};
