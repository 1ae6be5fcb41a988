//! Harness configuration.
//!
//! `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::types::CaptureMode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on tool-specific poll interval overrides.
pub const MAX_POLL_INTERVAL_SEC: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    /// Root for per-job working directories.
    pub work_dir: PathBuf,
    /// Durable area for checkpoints, keyed by dataset/job/step.
    pub transfer_dir: PathBuf,
    /// Partial results of failed runs are copied here.
    pub failure_archive_dir: PathBuf,
    /// Final results of successful runs are copied here.
    pub results_dir: PathBuf,
    /// Where input files and parameter files are retrieved from.
    pub source_dir: PathBuf,
    /// JSONL status log; `None` logs status through tracing only.
    pub status_log: Option<PathBuf>,

    // Cadence
    pub poll_interval_sec: u64,
    pub status_interval_sec: u64,
    pub checkpoint_interval_sec: u64,
    /// Wall-clock limit per tool run, 0 = unlimited.
    pub tool_timeout_sec: u64,

    // Process invocation
    pub max_inline_args_len: usize,
    pub capture_mode: CaptureMode,

    // Tool executables
    pub icr2ls_path: PathBuf,
    pub formularity_path: PathBuf,
    pub ascore_path: PathBuf,

    /// Skip recording checkpoints in the safe-to-delete list after success.
    pub keep_checkpoints: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            transfer_dir: PathBuf::from("transfer"),
            failure_archive_dir: PathBuf::from("failed_results"),
            results_dir: PathBuf::from("results"),
            source_dir: PathBuf::from("source"),
            status_log: None,
            poll_interval_sec: 4,
            status_interval_sec: 60,
            checkpoint_interval_sec: 60,
            tool_timeout_sec: 0,
            max_inline_args_len: 250,
            capture_mode: CaptureMode::File,
            icr2ls_path: PathBuf::from("ICR2LS.exe"),
            formularity_path: PathBuf::from("CIA.exe"),
            ascore_path: PathBuf::from("AScore_Console.exe"),
            keep_checkpoints: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Apply a `key=value` override, e.g. from a `--set` flag.
    pub fn apply_override(&mut self, pair: &str) -> Result<()> {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::InvalidLine(pair.to_string()));
        };
        self.apply_value(key.trim(), &Self::unquote(value.trim()))
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "work_dir" => self.work_dir = PathBuf::from(value),
            "transfer_dir" => self.transfer_dir = PathBuf::from(value),
            "failure_archive_dir" => self.failure_archive_dir = PathBuf::from(value),
            "results_dir" => self.results_dir = PathBuf::from(value),
            "source_dir" => self.source_dir = PathBuf::from(value),
            "status_log" => {
                self.status_log = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "poll_interval_sec" => self.poll_interval_sec = Self::parse_int(key, value)?,
            "status_interval_sec" => self.status_interval_sec = Self::parse_int(key, value)?,
            "checkpoint_interval_sec" => {
                self.checkpoint_interval_sec = Self::parse_int(key, value)?;
            }
            "tool_timeout_sec" => self.tool_timeout_sec = Self::parse_int(key, value)?,
            "max_inline_args_len" => self.max_inline_args_len = Self::parse_int(key, value)?,
            "capture_mode" => {
                self.capture_mode = match value {
                    "file" => CaptureMode::File,
                    "memory" => CaptureMode::Memory,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "capture_mode must be 'file' or 'memory', got '{value}'"
                        )))
                    }
                }
            }
            "icr2ls_path" => self.icr2ls_path = PathBuf::from(value),
            "formularity_path" => self.formularity_path = PathBuf::from(value),
            "ascore_path" => self.ascore_path = PathBuf::from(value),
            "keep_checkpoints" => self.keep_checkpoints = Self::parse_bool(key, value)?,
            _ => {
                // Unknown keys warn but don't fail so older configs keep loading.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_sec)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_sec)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_sec > 0).then(|| Duration::from_secs(self.tool_timeout_sec))
    }

    /// Resolve relative paths against a base directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        for dir in [
            &mut self.work_dir,
            &mut self.transfer_dir,
            &mut self.failure_archive_dir,
            &mut self.results_dir,
            &mut self.source_dir,
        ] {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        if let Some(ref status_log) = self.status_log {
            if status_log.is_relative() {
                self.status_log = Some(base.join(status_log));
            }
        }
    }
}

/// Clamp a tool-specific poll override to `MAX_POLL_INTERVAL_SEC`.
pub fn clamp_poll_interval(requested: Duration) -> Duration {
    requested.clamp(
        Duration::from_millis(10),
        Duration::from_secs(MAX_POLL_INTERVAL_SEC),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.poll_interval_sec, 4);
        assert_eq!(config.status_interval_sec, 60);
        assert_eq!(config.checkpoint_interval_sec, 60);
        assert_eq!(config.max_inline_args_len, 250);
        assert_eq!(config.capture_mode, CaptureMode::File);
        assert!(config.tool_timeout().is_none());
        assert!(!config.keep_checkpoints);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# harness settings
transfer_dir="/mnt/transfer"
poll_interval_sec=2
tool_timeout_sec=3600
capture_mode=memory
keep_checkpoints=yes
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.transfer_dir, PathBuf::from("/mnt/transfer"));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(3600)));
        assert_eq!(config.capture_mode, CaptureMode::Memory);
        assert!(config.keep_checkpoints);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("poll_interval_sec=soon"),
            Err(ConfigError::InvalidInt { .. })
        ));
        assert!(matches!(
            config.parse_content("keep_checkpoints=maybe"),
            Err(ConfigError::InvalidBool { .. })
        ));
        assert!(config.parse_content("capture_mode=pipe").is_err());
        assert!(config.parse_content("no equals sign").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("legacy_setting=1").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn override_pairs_apply() {
        let mut config = Config::default();
        config.apply_override("max_inline_args_len=80").unwrap();
        assert_eq!(config.max_inline_args_len, 80);
        assert!(config.apply_override("max_inline_args_len").is_err());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn resolve_paths_only_touches_relative() {
        let mut config = Config {
            results_dir: PathBuf::from("/abs/results"),
            status_log: Some(PathBuf::from("status.jsonl")),
            ..Config::default()
        };
        config.resolve_paths(Path::new("/base"));
        assert_eq!(config.work_dir, PathBuf::from("/base/work"));
        assert_eq!(config.results_dir, PathBuf::from("/abs/results"));
        assert_eq!(config.status_log, Some(PathBuf::from("/base/status.jsonl")));
    }

    #[test]
    fn poll_overrides_are_clamped() {
        assert_eq!(
            clamp_poll_interval(Duration::from_secs(60)),
            Duration::from_secs(15)
        );
        assert_eq!(
            clamp_poll_interval(Duration::from_secs(15)),
            Duration::from_secs(15)
        );
        assert_eq!(
            clamp_poll_interval(Duration::from_millis(200)),
            Duration::from_millis(200)
        );
    }
}
