//! Configuration
//!
//! Two layers, merged in order:
//! - Optional TOML file at the OS config location
//!   (`<config_dir>/gpuwatch/config.toml`)
//! - Command-line flags, which override whatever the file set
//!
//! The merged result is validated once into the process-lifetime values the
//! loop needs (connection target, availability rule, cadence).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::AvailabilityRule;
use crate::status::{StatusQuery, StatusSchema, DEFAULT_QUERY_COMMAND};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no user configured (use --user, optionally as user@host)")]
    MissingUser,
    #[error("no host configured (use --host, or --user user@host)")]
    MissingHost,
    #[error("--min-gpus must be at least 1")]
    ZeroMinGpus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub connection: ConnectionConfig,
    pub monitor: MonitorOptions,
}

/// Where and how to connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// User name; `user@host` is accepted when `host` is not set.
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    /// Private key file; when absent, the operator is prompted for a password.
    pub key: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: None,
            host: None,
            port: 22,
            key: None,
        }
    }
}

/// Loop behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOptions {
    /// Seconds between checks, measured from the end of each check's work.
    pub step_secs: u64,
    /// Alert when at least this many GPUs qualify.
    pub min_gpus: u32,
    /// When set, a GPU qualifies by free memory (strictly more than this
    /// many MiB) instead of being fully idle.
    pub min_ram_mib: Option<u64>,
    /// Sound file to play alongside the notification.
    pub alert_sound: Option<PathBuf>,
    /// Remote status query command.
    pub query_command: String,
    /// Schema the query's output is parsed with.
    pub schema: StatusSchema,
    /// Per-check deadline for the remote command.
    pub exec_timeout_secs: u64,
    /// Stop after this many checks; unset polls forever.
    pub max_ticks: Option<u64>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            step_secs: 60,
            min_gpus: 1,
            min_ram_mib: None,
            alert_sound: None,
            query_command: DEFAULT_QUERY_COMMAND.to_string(),
            schema: StatusSchema::default(),
            exec_timeout_secs: 30,
            max_ticks: None,
        }
    }
}

/// Fully resolved connection target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key: Option<PathBuf>,
}

impl Target {
    pub fn addr(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl MonitorConfig {
    /// Load from the OS-specific location; defaults when no file exists.
    pub async fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_file_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not find config directory"))?;
        path.push("gpuwatch");
        path.push("config.toml");
        Ok(path)
    }
}

impl ConnectionConfig {
    /// Validate into a concrete target, splitting `user@host` when the host
    /// was not given separately.
    pub fn resolve(&self) -> Result<Target, ConfigError> {
        let user_field = self.user.as_deref().ok_or(ConfigError::MissingUser)?;

        let (user, host) = match &self.host {
            Some(host) => (user_field.to_string(), host.clone()),
            None => {
                let (user, host) = user_field
                    .split_once('@')
                    .ok_or(ConfigError::MissingHost)?;
                (user.to_string(), host.to_string())
            }
        };

        if user.is_empty() {
            return Err(ConfigError::MissingUser);
        }
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }

        Ok(Target {
            user,
            host,
            port: self.port,
            key: self.key.clone(),
        })
    }
}

impl MonitorOptions {
    pub fn rule(&self) -> Result<AvailabilityRule, ConfigError> {
        if self.min_gpus == 0 {
            return Err(ConfigError::ZeroMinGpus);
        }
        Ok(AvailabilityRule {
            min_devices: self.min_gpus,
            min_free_mib: self.min_ram_mib,
        })
    }

    pub fn query(&self) -> StatusQuery {
        StatusQuery {
            command: self.query_command.clone(),
            schema: self.schema,
        }
    }
}
