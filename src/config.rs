//! Configuration management for streamcap

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transcode::DEFAULT_GRACEFUL_PATTERNS;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// External tool locations
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Where recordings go
    #[serde(default)]
    pub output: OutputConfig,

    /// Job supervisor tuning
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Exit message patterns treated as a graceful stop
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Sequential bulk action pacing
    #[serde(default)]
    pub bulk: BulkConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the ffmpeg binary. Falls back to `ffmpeg` on PATH when unset
    /// or when the file does not exist.
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default directory for captures
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Capacity of the worker event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Time a tool gets to exit after SIGTERM before it is killed (ms)
    #[serde(default = "default_stop_grace_period_ms")]
    pub stop_grace_period_ms: u64,

    /// How long shutdown waits for running jobs to finish (ms)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Keep finished jobs in the registry until acknowledged
    #[serde(default = "default_true")]
    pub retain_terminal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Case-insensitive substrings of the tool's stderr that mark a clean stop
    #[serde(default = "default_graceful_patterns")]
    pub graceful_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Pause after each successful item (ms)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Attempts per item before it is given up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay (ms), doubled on each further attempt
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Retry delay ceiling (ms)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

// Default value functions
fn default_output_directory() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.video_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join("streamcap")
}

fn default_event_buffer() -> usize {
    256
}

fn default_stop_grace_period_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_graceful_patterns() -> Vec<String> {
    DEFAULT_GRACEFUL_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_cooldown_ms() -> u64 {
    1_500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
            stop_grace_period_ms: default_stop_grace_period_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            retain_terminal: default_true(),
        }
    }
}

impl SupervisorConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            graceful_patterns: default_graceful_patterns(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_config_path()?)
    }

    /// Load configuration from `config_path`, writing defaults if it is missing
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "streamcap", "streamcap")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(path.clone()).unwrap();

        assert!(path.exists());
        assert_eq!(config.config_path().unwrap(), path);
        assert_eq!(config.supervisor.event_buffer, 256);
        assert!(config.supervisor.retain_terminal);
        assert_eq!(config.bulk.cooldown_ms, 1_500);
        assert!(config.tools.ffmpeg_path.is_none());
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[tools]\nffmpeg_path = \"/opt/ffmpeg/bin/ffmpeg\"\n\n[supervisor]\nstop_grace_period_ms = 500\n",
        )
        .unwrap();

        let config = Config::load_from(path).unwrap();

        assert_eq!(
            config.tools.ffmpeg_path,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
        assert_eq!(
            config.supervisor.stop_grace_period(),
            Duration::from_millis(500)
        );
        assert_eq!(config.supervisor.shutdown_timeout_ms, 15_000);
        assert_eq!(
            config.classifier.graceful_patterns,
            vec!["Exiting normally", "Immediate exit requested"]
        );
    }

    #[test]
    fn test_save_round_trips_tool_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::load_from(path.clone()).unwrap();

        config.tools.ffmpeg_path = Some(PathBuf::from("/usr/local/bin/ffmpeg"));
        config.save().unwrap();

        let reloaded = Config::load_from(path).unwrap();
        assert_eq!(
            reloaded.tools.ffmpeg_path,
            Some(PathBuf::from("/usr/local/bin/ffmpeg"))
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[supervisor\nevent_buffer = ").unwrap();

        let err = Config::load_from(path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
