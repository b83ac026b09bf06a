use std::path::PathBuf;
use clap::{Parser, ValueEnum};
use crate::config::{TreesyncConfig, WatchMode};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(author = "Treesync Team")]
#[command(version = "0.2.0")]
#[command(about = "Watch two directory trees and report their changes as filtered batches")]
#[command(long_about = "Treesync watches a pair of directory trees, coalesces raw change notifications into ordered batches, and drops the echoes of its own writes. Type pause, resume, resync or halt on stdin to control the running task.")]
pub struct Cli {
    /// Left directory of the pair
    #[arg(value_name = "LEFT", help = "Left directory to watch")]
    pub left: PathBuf,

    /// Right directory of the pair
    #[arg(value_name = "RIGHT", help = "Right directory to watch")]
    pub right: PathBuf,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Watch mode - how to observe local directories
    #[arg(short, long, help = "File watching mode")]
    pub mode: Option<WatchMode>,

    /// Polling interval in milliseconds (for polling mode)
    #[arg(long, help = "Polling interval in ms")]
    pub poll_interval: Option<u64>,

    /// Ignore additional patterns beyond .gitignore
    #[arg(long, value_delimiter = ',', help = "Additional patterns to ignore")]
    pub ignore: Option<Vec<String>>,

    /// Quiet period that closes a batch
    #[arg(long, help = "Batch quiet period in ms")]
    pub quiet_period: Option<u64>,

    /// How long writes through the task stay suppressed
    #[arg(long, help = "Echo suppression window in ms")]
    pub suppression_window: Option<u64>,

    /// Output format
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Task label shown in status lines
    #[arg(long, help = "Label for the sync task")]
    pub label: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Disable colors in output
    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON output for scripting
    Json,
    /// Compact single-line format
    Compact,
}

impl Cli {
    pub fn task_label(&self) -> String {
        self.label.clone().unwrap_or_else(|| {
            format!("{} <-> {}", self.left.display(), self.right.display())
        })
    }

    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(!self.no_color)
            .with_writer(std::io::stderr)
            .init();
    }

    pub fn validate(&self) -> Result<(), String> {
        for path in [&self.left, &self.right] {
            if !path.exists() {
                return Err(format!("Path does not exist: {}", path.display()));
            }

            if !path.is_dir() {
                return Err(format!("Path is not a directory: {}", path.display()));
            }
        }

        if self.left == self.right {
            return Err("Left and right must be different directories".to_string());
        }

        if self.poll_interval == Some(0) {
            return Err("Poll interval must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Command-line flags win over file and environment settings
    pub fn apply_overrides(&self, config: &mut TreesyncConfig) {
        if let Some(mode) = &self.mode {
            config.watcher.mode = mode.clone();
        }

        if let Some(ms) = self.poll_interval {
            config.watcher.poll_interval_ms = ms;
        }

        if let Some(patterns) = &self.ignore {
            config.watcher.ignore.extend(patterns.iter().cloned());
        }

        if let Some(ms) = self.quiet_period {
            config.batcher.quiet_period_ms = ms;
            if config.batcher.max_batch_age_ms < ms {
                config.batcher.max_batch_age_ms = ms;
            }
        }

        if let Some(ms) = self.suppression_window {
            config.filter.suppression_window_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair_and_flags() {
        let cli = Cli::parse_from([
            "treesync",
            "a",
            "b",
            "--mode",
            "polling",
            "--ignore",
            "*.log,tmp/",
            "--quiet-period",
            "8000",
            "--output",
            "json",
        ]);

        assert_eq!(cli.left, PathBuf::from("a"));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.task_label(), "a <-> b");

        let mut config = TreesyncConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.watcher.mode, WatchMode::Polling);
        assert_eq!(config.watcher.ignore, vec!["*.log".to_string(), "tmp/".to_string()]);
        assert_eq!(config.batcher.quiet_period_ms, 8000);
        assert_eq!(config.batcher.max_batch_age_ms, 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let left = dir.path().join("left");
        std::fs::create_dir(&left).unwrap();

        let cli = Cli::parse_from(["treesync", left.to_str().unwrap(), left.to_str().unwrap()]);
        assert!(cli.validate().is_err());

        let missing = dir.path().join("missing");
        let cli = Cli::parse_from(["treesync", left.to_str().unwrap(), missing.to_str().unwrap()]);
        assert!(cli.validate().unwrap_err().contains("does not exist"));
    }
}
