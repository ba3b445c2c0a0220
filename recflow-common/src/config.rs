//! Bootstrap configuration loading
//!
//! Configuration is a single TOML file. Every section and field has a
//! built-in default, so an empty file (or no file at all) yields a usable
//! in-memory setup.
//!
//! # Config File Resolution Priority
//!
//! 1. Command-line argument (highest priority)
//! 2. `RECFLOW_CONFIG` environment variable
//! 3. `<config_dir>/recflow/config.toml` (platform config directory)
//! 4. Compiled defaults (fallback)
//!
//! A file named explicitly (priority 1 or 2) must exist. A missing file at
//! the platform location is not an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "RECFLOW_CONFIG";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pipeline engine tuning
    #[serde(default)]
    pub engine: EngineSettings,

    /// Ingress stream sizing
    #[serde(default)]
    pub ingress: IngressSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local maps, lost on exit
    #[default]
    Memory,
    /// SQLite database file
    Sqlite,
}

/// `[storage]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file (required when backend = "sqlite")
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Order of user fan-out relative to generic classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutOrder {
    /// Generic classifiers run first, then related users are refreshed
    #[default]
    AfterClassification,
    /// Related users are refreshed right after features are committed
    BeforeClassification,
}

/// `[engine]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound for a single plugin invocation (no bound when absent)
    #[serde(default)]
    pub plugin_timeout_ms: Option<u64>,

    /// Global cap on concurrently running pipelines (no cap when absent)
    #[serde(default)]
    pub max_concurrent_pipelines: Option<usize>,

    /// Related users refreshed concurrently during fan-out (1 = sequential)
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,

    #[serde(default)]
    pub fan_out_order: FanOutOrder,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: None,
            max_concurrent_pipelines: None,
            fan_out_concurrency: default_fan_out_concurrency(),
            fan_out_order: FanOutOrder::default(),
        }
    }
}

/// `[ingress]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressSettings {
    /// Pending submissions buffered before producers are suspended
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Writes processed concurrently per ingress stream
    #[serde(default = "default_ingress_concurrency")]
    pub concurrency: usize,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            concurrency: default_ingress_concurrency(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_fan_out_concurrency() -> usize {
    4
}

fn default_buffer_size() -> usize {
    64
}

fn default_ingress_concurrency() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.storage.backend == StorageBackend::Sqlite && self.storage.database_path.is_none() {
            return Err(Error::Config(
                "storage.database_path is required for the sqlite backend".to_string(),
            ));
        }
        if self.engine.fan_out_concurrency == 0 {
            return Err(Error::Config(
                "engine.fan_out_concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.max_concurrent_pipelines == Some(0) {
            return Err(Error::Config(
                "engine.max_concurrent_pipelines must be at least 1".to_string(),
            ));
        }
        if self.ingress.buffer_size == 0 || self.ingress.concurrency == 0 {
            return Err(Error::Config(
                "ingress.buffer_size and ingress.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and validate a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    TomlConfig::from_toml_str(&content)
}

/// Write config to disk (used by tooling and tests)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Platform default config file location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("recflow").join("config.toml"))
}

/// Resolve which config file (if any) should be loaded
///
/// Returns `Ok(None)` when nothing was named and no file exists at the
/// platform location.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Result<Option<PathBuf>> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return require_exists(path.to_path_buf()).map(Some);
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return require_exists(PathBuf::from(path)).map(Some);
        }
    }

    // Priority 3: Platform config directory
    if let Some(path) = default_config_path() {
        if path.exists() {
            return Ok(Some(path));
        }
        debug!("No config file at {}", path.display());
    }

    Ok(None)
}

fn require_exists(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(Error::Config(format!("Config file not found: {}", path.display())))
    }
}

/// Resolve and load configuration, falling back to compiled defaults
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg)? {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        None => {
            info!("No configuration file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}
