//! Configuration management for treesync
//!
//! This module provides configuration structures and defaults for the
//! pipeline stages: watching, batching, echo filtering, and supervision.

use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Global configuration for a sync pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreesyncConfig {
    /// Local file watching configuration
    pub watcher: WatcherConfig,
    /// Event coalescing configuration
    pub batcher: BatcherConfig,
    /// Echo suppression configuration
    pub filter: FilterConfig,
    /// Worker restart policy
    pub supervisor: SupervisorConfig,
}

/// How local directories are observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Automatic detection (native events with polling fallback)
    Auto,
    /// Use native file system events
    Native,
    /// Use polling-based watching
    Polling,
}

/// Configuration for local file watching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub mode: WatchMode,
    /// Polling interval in milliseconds (polling mode and fallback)
    pub poll_interval_ms: u64,
    /// Extra gitignore-style patterns
    pub ignore: Vec<String>,
}

/// Configuration for the batcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Close a batch after this long without new events (milliseconds)
    pub quiet_period_ms: u64,
    /// Close a batch once it has been open this long (milliseconds)
    pub max_batch_age_ms: u64,
}

/// Configuration for echo suppression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// How long a path stays suppressed after a call through the filter (milliseconds)
    pub suppression_window_ms: u64,
    /// Also suppress paths read through `load_node`
    pub suppress_loads: bool,
}

/// Restart policy for supervised workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Crashes tolerated inside `restart_window_secs` before giving up
    pub max_restarts: usize,
    pub restart_window_secs: u64,
    /// Delay before relaunching a crashed worker (milliseconds)
    pub backoff_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            poll_interval_ms: 1000,
            ignore: Vec::new(),
        }
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 1000,
            max_batch_age_ms: 5000,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            suppression_window_ms: 1000,
            suppress_loads: false,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window_secs: 30,
            backoff_ms: 250,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BatcherConfig {
    pub fn quiet_period_duration(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn max_batch_age_duration(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }
}

impl FilterConfig {
    pub fn suppression_window_duration(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }
}

impl SupervisorConfig {
    pub fn restart_window_duration(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    pub fn backoff_duration(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration loading and management
impl TreesyncConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from `path` when given, otherwise defaults; then apply environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Override with environment variables if present
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64("TREESYNC_SUPPRESSION_WINDOW_MS") {
            self.filter.suppression_window_ms = ms;
        }

        if let Some(ms) = env_u64("TREESYNC_QUIET_PERIOD_MS") {
            self.batcher.quiet_period_ms = ms;
        }

        if let Some(ms) = env_u64("TREESYNC_MAX_BATCH_AGE_MS") {
            self.batcher.max_batch_age_ms = ms;
        }

        if let Some(ms) = env_u64("TREESYNC_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = ms;
        }

        if let Some(max) = env_u64("TREESYNC_MAX_RESTARTS") {
            self.supervisor.max_restarts = max as usize;
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.filter.suppression_window_ms == 0 {
            return Err("suppression_window_ms must be greater than 0".to_string());
        }

        if self.batcher.quiet_period_ms == 0 {
            return Err("quiet_period_ms must be greater than 0".to_string());
        }

        if self.batcher.max_batch_age_ms < self.batcher.quiet_period_ms {
            return Err("max_batch_age_ms must not be shorter than quiet_period_ms".to_string());
        }

        if self.watcher.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".to_string());
        }

        if self.supervisor.restart_window_secs == 0 {
            return Err("restart_window_secs must be greater than 0".to_string());
        }

        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TreesyncConfig::default();

        assert_eq!(config.filter.suppression_window_ms, 1000);
        assert!(!config.filter.suppress_loads);
        assert_eq!(config.batcher.quiet_period_ms, 1000);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.watcher.mode, WatchMode::Auto);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TreesyncConfig::default();
        assert!(config.validate().is_ok());

        config.filter.suppression_window_ms = 0;
        assert!(config.validate().is_err());

        config.filter.suppression_window_ms = 1000;
        config.batcher.max_batch_age_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = TreesyncConfig::default();

        assert_eq!(config.filter.suppression_window_duration(), Duration::from_secs(1));
        assert_eq!(config.batcher.max_batch_age_duration(), Duration::from_secs(5));
        assert_eq!(config.supervisor.restart_window_duration(), Duration::from_secs(30));
        assert_eq!(config.supervisor.backoff_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_toml() {
        let config = TreesyncConfig::from_toml(
            r#"
            [watcher]
            mode = "polling"
            ignore = ["*.log"]

            [filter]
            suppression_window_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.watcher.mode, WatchMode::Polling);
        assert_eq!(config.watcher.ignore, vec!["*.log".to_string()]);
        assert_eq!(config.filter.suppression_window_ms, 1500);
        // Untouched sections keep their defaults
        assert_eq!(config.batcher, BatcherConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("treesync.toml");
        std::fs::write(&path, "[supervisor]\nmax_restarts = 2\n").unwrap();

        let config = TreesyncConfig::load(&path).unwrap();
        assert_eq!(config.supervisor.max_restarts, 2);

        assert!(TreesyncConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_config_loading() {
        std::env::set_var("TREESYNC_SUPPRESSION_WINDOW_MS", "2500");
        std::env::set_var("TREESYNC_MAX_RESTARTS", "9");

        let config = TreesyncConfig::from_env();

        assert_eq!(config.filter.suppression_window_ms, 2500);
        assert_eq!(config.supervisor.max_restarts, 9);

        // Cleanup
        std::env::remove_var("TREESYNC_SUPPRESSION_WINDOW_MS");
        std::env::remove_var("TREESYNC_MAX_RESTARTS");
    }
}
