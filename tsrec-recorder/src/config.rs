//! Recorder configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::rtp;
use crate::device::NameComparison;
use crate::scheduler::InhibitorKind;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tsrec-recorder.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What a directory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryUsage {
    Recording,
    Timeshift,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub directories: Vec<DirectoryConfig>,
    #[serde(default)]
    pub devices: DevicesSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub callback: CallbackSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Name reported when registering with a scheduler.
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub local_path: PathBuf,
    /// Path under which remote clients reach the directory.
    #[serde(default)]
    pub network_path: Option<String>,
    #[serde(default)]
    pub usage: Vec<DirectoryUsage>,
}

impl DirectoryConfig {
    /// Network path, or the local path if none is configured.
    pub fn share(&self) -> String {
        self.network_path
            .clone()
            .unwrap_or_else(|| self.local_path.display().to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesSection {
    /// Device names; list order is allocation priority.
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub name_comparison: NameComparison,
    #[serde(default)]
    pub rtp: RtpSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtpSection {
    #[serde(default = "rtp::default_bind")]
    pub bind: SocketAddr,
}

impl Default for RtpSection {
    fn default() -> Self {
        Self {
            bind: rtp::default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub busy_retry_ms: u64,
    #[serde(default)]
    pub sleep_inhibitor: InhibitorKind,
}

impl SchedulerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn busy_retry(&self) -> Duration {
        Duration::from_millis(self.busy_retry_ms)
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_interval_ms(),
            busy_retry_ms: default_interval_ms(),
            sleep_inhibitor: InhibitorKind::default(),
        }
    }
}

/// How progress is reported to schedulers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackSection {
    #[serde(default)]
    pub kind: CallbackKind,
    /// Request path of webhook callbacks.
    #[serde(default = "default_callback_path")]
    pub path: String,
}

impl Default for CallbackSection {
    fn default() -> Self {
        Self {
            kind: CallbackKind::default(),
            path: default_callback_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            retention_days: default_retention_days(),
            level: default_log_level(),
        }
    }
}

fn default_service_name() -> String {
    "tsrec".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_callback_path() -> String {
    "/recorder/callback".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_retention_days() -> u64 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RecorderConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    /// Check the settings the recorder cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recording_directory().is_none() {
            return Err(ConfigError::Invalid(
                "no directory with recording usage".into(),
            ));
        }
        if self.devices.names.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".into()));
        }

        let comparison = self.devices.name_comparison;
        for (i, name) in self.devices.names.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::Invalid("empty device name".into()));
            }
            if self.devices.names[..i]
                .iter()
                .any(|other| comparison.matches(other, name))
            {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name: {}",
                    name
                )));
            }
        }

        if self.scheduler.poll_interval_ms == 0 || self.scheduler.busy_retry_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// First directory used for recordings.
    pub fn recording_directory(&self) -> Option<&Path> {
        self.directories_for(DirectoryUsage::Recording)
            .next()
            .map(|dir| dir.local_path.as_path())
    }

    /// Network paths of all directories with `usage`.
    pub fn shares(&self, usage: DirectoryUsage) -> Vec<String> {
        self.directories_for(usage).map(DirectoryConfig::share).collect()
    }

    fn directories_for(&self, usage: DirectoryUsage) -> impl Iterator<Item = &DirectoryConfig> {
        self.directories
            .iter()
            .filter(move |dir| dir.usage.contains(&usage))
    }
}

impl std::str::FromStr for RecorderConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: RecorderConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
