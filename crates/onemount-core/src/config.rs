//! Configuration module for onemount.
//!
//! Typed structs that map to the YAML configuration file, with
//! loading, validation, and defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for onemount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub cache: CacheConfig,
    pub transfers: TransferConfig,
    pub delta: DeltaConfig,
    pub conflicts: ConflictsConfig,
    pub webhook: WebhookConfig,
    pub logging: LoggingConfig,
    pub fuse: FuseConfig,
}

/// Local cache settings (metadata database and content blobs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the metadata database and the `content/` blobs.
    pub dir: PathBuf,
    /// Maximum aggregate size of cached content in gigabytes; the
    /// least-recently-used fully-synced blobs are evicted beyond this.
    pub content_max_size_gb: u64,
}

/// Transfer pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Concurrent hydration workers.
    pub download_workers: usize,
    /// Concurrent upload workers.
    pub upload_workers: usize,
    /// Bound of each upload priority queue.
    pub upload_queue_depth: usize,
    /// Maximum low-priority uploads running at once.
    pub low_priority_parallelism: usize,
    /// Seconds a blocked filesystem operation waits for a transfer.
    pub operation_deadline_secs: u64,
}

/// Delta synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// Seconds between periodic delta queries.
    pub poll_interval_secs: u64,
    /// Seconds between connectivity probes.
    pub probe_interval_secs: u64,
}

/// Conflict resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictsConfig {
    /// `keep_both`, `last_writer_wins`, `local_wins`, or `remote_wins`.
    pub default_policy: String,
}

/// Change-notification webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Whether to register a subscription and listen for notifications.
    pub enabled: bool,
    /// Local listen address for the validation/notification endpoint.
    pub listen_addr: String,
    /// Externally reachable URL the remote posts notifications to.
    pub public_url: Option<String>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

/// FUSE mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuseConfig {
    /// Directory where the filesystem will be mounted.
    pub mount_point: PathBuf,
    /// Volume name reported to the kernel.
    pub volume_name: String,
    /// Seconds the kernel may cache attributes.
    pub attr_ttl_secs: u64,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/onemount/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("onemount")
            .join("config.yaml")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("onemount"),
            content_max_size_gb: 10,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_workers: 8,
            upload_workers: 4,
            upload_queue_depth: 256,
            low_priority_parallelism: 1,
            operation_deadline_secs: 120,
        }
    }
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            probe_interval_secs: 15,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            default_policy: "keep_both".to_string(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:8710".to_string(),
            public_url: None,
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

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_point: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("OneDrive"),
            volume_name: "OneDrive".to_string(),
            attr_ttl_secs: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    pub field: String,
    pub message: String,
}

impl Config {
    /// Checks the configuration for problems; an empty list means valid.
    pub fn validate(&self) -> Vec<ConfigProblem> {
        let mut problems = Vec::new();
        let mut push = |field: &str, message: String| {
            problems.push(ConfigProblem {
                field: field.to_string(),
                message,
            })
        };

        if self.cache.content_max_size_gb == 0 {
            push("cache.content_max_size_gb", "must be at least 1".into());
        }
        if self.transfers.download_workers == 0 {
            push("transfers.download_workers", "must be at least 1".into());
        }
        if self.transfers.upload_workers == 0 {
            push("transfers.upload_workers", "must be at least 1".into());
        }
        if self.transfers.upload_queue_depth == 0 {
            push("transfers.upload_queue_depth", "must be at least 1".into());
        }
        if self.delta.poll_interval_secs == 0 {
            push("delta.poll_interval_secs", "must be at least 1".into());
        }
        if crate::domain::ConflictPolicy::parse(&self.conflicts.default_policy).is_none() {
            push(
                "conflicts.default_policy",
                format!("unknown policy {:?}", self.conflicts.default_policy),
            );
        }
        if self.webhook.enabled && self.webhook.public_url.is_none() {
            push(
                "webhook.public_url",
                "required when webhook.enabled is true".into(),
            );
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = Config::default();
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.delta.poll_interval_secs, config.delta.poll_interval_secs);
        assert_eq!(loaded.cache.dir, config.cache.dir);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(config.conflicts.default_policy, "keep_both");
    }

    #[test]
    fn test_validation_problems() {
        let mut config = Config::default();
        config.transfers.download_workers = 0;
        config.conflicts.default_policy = "coin_flip".into();
        config.webhook.enabled = true;
        let problems = config.validate();
        let fields: Vec<&str> = problems.iter().map(|p| p.field.as_str()).collect();
        assert!(fields.contains(&"transfers.download_workers"));
        assert!(fields.contains(&"conflicts.default_policy"));
        assert!(fields.contains(&"webhook.public_url"));
    }
}
