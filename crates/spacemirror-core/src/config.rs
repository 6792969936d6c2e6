//! Configuration module for SpaceMirror.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for SpaceMirror.
///
/// Every section falls back to its defaults when omitted from the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub watcher: WatcherConfig,
    pub logging: LoggingConfig,
}

/// Reconciliation engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent reconciler workers.
    pub worker_count: usize,
    /// Milliseconds between two drains of the change watcher.
    pub drain_interval_ms: u64,
    /// Attempts granted to a path whose probe keeps failing before it is dropped.
    pub max_retries: u32,
    /// Milliseconds a failed path waits before being retried.
    pub retry_delay_ms: u64,
    /// Milliseconds an idle worker sleeps before re-checking the queue.
    pub idle_poll_ms: u64,
}

/// Change watcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Whether to subscribe to OS change notifications at all.
    pub enabled: bool,
    /// Whether a created directory is expanded into creations for its contents.
    pub expand_created_directories: bool,
    /// Maximum number of raw notifications buffered between two drains.
    pub channel_capacity: usize,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(error = %e, "Using default configuration");
                Self::default()
            }
        }
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/spacemirror/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("spacemirror")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            drain_interval_ms: 100,
            max_retries: 3,
            retry_delay_ms: 250,
            idle_poll_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expand_created_directories: true,
            channel_capacity: 65_536,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"engine.worker_count"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Upper bound for `engine.worker_count`.
const MAX_WORKERS: usize = 64;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- engine ---
        if self.engine.worker_count == 0 || self.engine.worker_count > MAX_WORKERS {
            errors.push(ValidationError {
                field: "engine.worker_count".into(),
                message: format!("must be in range 1..={MAX_WORKERS}"),
            });
        }
        if self.engine.drain_interval_ms == 0 {
            errors.push(ValidationError {
                field: "engine.drain_interval_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.engine.idle_poll_ms == 0 {
            errors.push(ValidationError {
                field: "engine.idle_poll_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- watcher ---
        if self.watcher.channel_capacity == 0 {
            errors.push(ValidationError {
                field: "watcher.channel_capacity".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use spacemirror_core::config::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .engine_worker_count(4)
///     .watcher_enabled(false)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- engine ---

    pub fn engine_worker_count(mut self, n: usize) -> Self {
        self.config.engine.worker_count = n;
        self
    }

    pub fn engine_drain_interval_ms(mut self, ms: u64) -> Self {
        self.config.engine.drain_interval_ms = ms;
        self
    }

    pub fn engine_max_retries(mut self, n: u32) -> Self {
        self.config.engine.max_retries = n;
        self
    }

    pub fn engine_retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.engine.retry_delay_ms = ms;
        self
    }

    pub fn engine_idle_poll_ms(mut self, ms: u64) -> Self {
        self.config.engine.idle_poll_ms = ms;
        self
    }

    // --- watcher ---

    pub fn watcher_enabled(mut self, enabled: bool) -> Self {
        self.config.watcher.enabled = enabled;
        self
    }

    pub fn watcher_expand_created_directories(mut self, expand: bool) -> Self {
        self.config.watcher.expand_created_directories = expand;
        self
    }

    pub fn watcher_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.watcher.channel_capacity = capacity;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
