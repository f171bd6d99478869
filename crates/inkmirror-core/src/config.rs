//! Configuration module for Inkmirror.
//!
//! Provides typed configuration structs that map to the YAML configuration
//! files for the server/worker processes and the device agent, with loading,
//! validation, and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Top-level configuration for the Inkmirror server and workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub object_store: ObjectStoreConfig,
    pub ocr: OcrConfig,
    pub ingestion: IngestionConfig,
    pub worker: WorkerConfig,
    pub secrets: SecretsConfig,
    pub logging: LoggingConfig,
}

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

/// Object store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Root directory for the filesystem-backed blob store.
    pub root: PathBuf,
}

/// Vision OCR provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Base URL of the OCR HTTP API.
    pub api_url: String,
    /// API key for the provider.
    pub api_key: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

/// Ingestion limits and policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Maximum uploads per minute per user.
    pub uploads_per_minute: u32,
    /// Maximum upload size in bytes.
    pub max_upload_bytes: u64,
    /// Hard cap on pages deferred to `pending_quota` per user.
    pub max_pending_quota_pages: i64,
}

/// Sync worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Base poll interval in seconds when the queue has work.
    pub poll_interval_seconds: u64,
    /// Maximum idle backoff in seconds.
    pub idle_backoff_max_seconds: u64,
    /// Lease duration in seconds.
    pub lease_seconds: u64,
    /// Work items claimed per poll.
    pub claim_batch_size: i64,
    /// Destination API call timeout in seconds.
    pub destination_timeout_seconds: u64,
}

/// Secret material used for credential encryption and token signing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Master secret for integration-credential key derivation.
    /// Combined with a per-user salt via HKDF; never logged.
    pub integration_master_key: String,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON-formatted logs when true.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Configuration for the device agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding the device's notebook files.
    pub source_directory: PathBuf,
    /// Whether the filesystem watcher is active.
    pub watch_enabled: bool,
    /// Base URL of the Inkmirror API.
    pub api_url: String,
    /// Upload automatically on change (vs. manual sync only).
    pub auto_sync: bool,
    /// Uploads drained per worker wake-up.
    pub batch_size: usize,
    /// Transport retry attempts per upload.
    pub retry_attempts: u32,
    /// Periodic full-scan interval in seconds.
    pub sync_interval_seconds: u64,
    /// Sync every notebook found under the source directory.
    pub sync_all_notebooks: bool,
    /// Explicit notebook selection when `sync_all_notebooks` is false.
    pub selected_notebooks: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl ServerConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the agent configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/inkmirror/agent.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("inkmirror")
            .join("agent.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/inkmirror/inkmirror.db"),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/inkmirror/blobs"),
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            api_url: "https://vision.googleapis.com/v1".to_string(),
            api_key: String::new(),
            timeout_seconds: 60,
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            uploads_per_minute: 10,
            max_upload_bytes: 50 * 1024 * 1024,
            max_pending_quota_pages: 100,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            idle_backoff_max_seconds: 30,
            lease_seconds: 60,
            claim_batch_size: 10,
            destination_timeout_seconds: 30,
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

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            source_directory: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Notebooks"),
            watch_enabled: true,
            api_url: "https://api.inkmirror.dev".to_string(),
            auto_sync: true,
            batch_size: 10,
            retry_attempts: 3,
            sync_interval_seconds: 60,
            sync_all_notebooks: true,
            selected_notebooks: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"worker.lease_seconds"`.
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

impl ServerConfig {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.ocr.timeout_seconds == 0 {
            errors.push(ValidationError {
                field: "ocr.timeout_seconds".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.ingestion.uploads_per_minute == 0 {
            errors.push(ValidationError {
                field: "ingestion.uploads_per_minute".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.ingestion.max_pending_quota_pages <= 0 {
            errors.push(ValidationError {
                field: "ingestion.max_pending_quota_pages".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.worker.lease_seconds == 0 {
            errors.push(ValidationError {
                field: "worker.lease_seconds".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.worker.poll_interval_seconds > self.worker.idle_backoff_max_seconds {
            errors.push(ValidationError {
                field: "worker.poll_interval_seconds".into(),
                message: "must not exceed worker.idle_backoff_max_seconds".into(),
            });
        }
        if self.worker.claim_batch_size <= 0 {
            errors.push(ValidationError {
                field: "worker.claim_batch_size".into(),
                message: "must be greater than zero".into(),
            });
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!("must be one of {VALID_LOG_LEVELS:?}"),
            });
        }

        errors
    }
}

impl AgentConfig {
    /// Validate the configuration and return all errors found.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push(ValidationError {
                field: "batch_size".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.sync_interval_seconds == 0 {
            errors.push(ValidationError {
                field: "sync_interval_seconds".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.api_url.is_empty() {
            errors.push(ValidationError {
                field: "api_url".into(),
                message: "must not be empty".into(),
            });
        }
        if !self.sync_all_notebooks && self.selected_notebooks.is_empty() {
            errors.push(ValidationError {
                field: "selected_notebooks".into(),
                message: "must name at least one notebook when sync_all_notebooks is false".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_server_defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_empty());
    }

    #[test]
    fn test_agent_defaults_are_valid() {
        assert!(AgentConfig::default().validate().is_empty());
    }

    #[test]
    fn test_server_validation_catches_zero_timeout() {
        let mut cfg = ServerConfig::default();
        cfg.ocr.timeout_seconds = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "ocr.timeout_seconds"));
    }

    #[test]
    fn test_server_validation_poll_vs_backoff() {
        let mut cfg = ServerConfig::default();
        cfg.worker.poll_interval_seconds = 120;
        let errors = cfg.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "worker.poll_interval_seconds"));
    }

    #[test]
    fn test_agent_validation_selection() {
        let mut cfg = AgentConfig::default();
        cfg.sync_all_notebooks = false;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "selected_notebooks"));

        cfg.selected_notebooks.push("uuid-1".into());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_agent_config_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "source_directory: /data/notebooks\n\
             watch_enabled: true\n\
             api_url: https://api.example.com\n\
             auto_sync: false\n\
             batch_size: 5\n\
             retry_attempts: 2\n\
             sync_interval_seconds: 30\n\
             sync_all_notebooks: true\n\
             selected_notebooks: []"
        )
        .unwrap();

        let cfg = AgentConfig::load(file.path()).unwrap();
        assert_eq!(cfg.batch_size, 5);
        assert!(!cfg.auto_sync);
        assert_eq!(cfg.source_directory, PathBuf::from("/data/notebooks"));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let cfg = AgentConfig::load_or_default(Path::new("/nonexistent/agent.yaml"));
        assert_eq!(cfg.batch_size, 10);
    }
}
