//! Configuration management for the ingest pipeline.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::persist::BackpressurePolicy;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};
use std::num::NonZeroU64;
use std::time::Duration;
use vigil_storage::DatabaseConfig;

/// Slowest paced replay accepted by `validate` (one frame per 100 seconds).
pub const MIN_SOURCE_FPS: f64 = 0.01;

/// Main configuration for the ingest pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Frame source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Frame processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Event persistence configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// File path, stream URL or device index
    #[serde(default)]
    pub url: String,

    /// Identifier recorded in every event (defaults to the url)
    #[serde(default)]
    pub id: Option<String>,

    /// Replay cadence in frames per second (0 = as fast as possible)
    #[serde(default)]
    pub fps: f64,
}

/// Detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Model identifier recorded in `model_info`
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Detections below this confidence are discarded
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

/// Frame processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Process every Nth frame
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,

    /// Classes kept after detection (empty = keep all)
    #[serde(
        default = "default_target_classes",
        deserialize_with = "deserialize_class_list"
    )]
    pub target_classes: Vec<String>,

    /// Maximum number of events pending persistence
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// What to do when the persistence queue is full
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// How long a graceful shutdown may spend draining the queue
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Stop after this many raw frames (0 = until end of stream)
    #[serde(default)]
    pub max_frames: u64,
}

/// Event persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Write detection events to the store
    #[serde(default)]
    pub enabled: bool,

    /// Store connection parameters
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Connection attempts before falling back to degraded mode
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_model_name() -> String {
    "yolov8m.pt".to_string()
}
fn default_confidence_threshold() -> f64 {
    0.5
}
fn default_frame_skip() -> u64 {
    1
}
fn default_target_classes() -> Vec<String> {
    ["person", "car", "truck", "bus", "motorcycle", "bicycle"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_queue_size() -> usize {
    256
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

/// Accepts either `"person, car"` or `["person", "car"]`.
fn deserialize_class_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ClassList {
        Csv(String),
        List(Vec<String>),
    }

    let classes = match ClassList::deserialize(deserializer)? {
        ClassList::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        ClassList::List(list) => list,
    };
    Ok(normalize_classes(classes))
}

fn normalize_classes(classes: Vec<String>) -> Vec<String> {
    classes
        .into_iter()
        .map(|class| class.trim().to_string())
        .filter(|class| !class.is_empty())
        .collect()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            target_classes: default_target_classes(),
            queue_size: default_queue_size(),
            backpressure: BackpressurePolicy::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_frames: 0,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database: DatabaseConfig::default(),
            connect_attempts: default_connect_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Local config file (config/ingest.toml)
    /// 2. System config file (/etc/vigil/ingest.toml)
    /// 3. Environment variables (prefixed with INGEST__)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/vigil/ingest").required(false))
            // Override with environment variables (e.g., INGEST__SOURCE__URL)
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("source.url".to_string()));
        }

        let fps = self.source.fps;
        if !fps.is_finite() || fps < 0.0 || (fps > 0.0 && fps < MIN_SOURCE_FPS) {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.fps".to_string(),
                message: format!("FPS must be 0 (unpaced) or at least {}", MIN_SOURCE_FPS),
            });
        }

        if self.detector.model_name.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "detector.model_name".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.confidence_threshold".to_string(),
                message: "Threshold must be between 0 and 1".to_string(),
            });
        }

        if self.processing.frame_skip == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.frame_skip".to_string(),
                message: "Frame skip must be at least 1".to_string(),
            });
        }

        if self.processing.queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.queue_size".to_string(),
                message: "Queue size must be at least 1".to_string(),
            });
        }

        if self.persistence.enabled && self.persistence.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "persistence.database.url".to_string(),
            ));
        }

        Ok(())
    }
}

impl SourceConfig {
    /// Identifier recorded as `source_id`.
    pub fn source_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.url)
    }

    /// Delay between replayed frames, if paced.
    pub fn frame_interval(&self) -> Option<Duration> {
        if self.fps > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.fps).ok()
        } else {
            None
        }
    }
}

impl ProcessingConfig {
    /// Frame skip interval; `validate` guarantees it is non-zero.
    pub fn skip_interval(&self) -> NonZeroU64 {
        NonZeroU64::new(self.frame_skip).unwrap_or(NonZeroU64::MIN)
    }

    /// Get shutdown drain timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Frame limit, if any.
    pub fn frame_limit(&self) -> Option<u64> {
        (self.max_frames > 0).then_some(self.max_frames)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
