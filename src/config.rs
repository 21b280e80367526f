//! Global configuration at ~/.config/tasksync/config.toml

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use config::{Config, File};
use serde::Deserialize;
use tasksync_core::sync::RetryPolicy;

static DEFAULT_DATA_DIR: &str = "~/.local/share/tasksync";

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Deserialize, Clone, Debug)]
pub struct SyncConfig {
    /// Accounts synced at the same time; defaults to the CPU count
    pub max_workers: Option<usize>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retries after the first attempt of a failed request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_workers: None,
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// IANA zone for local times; the system zone when unset
    pub timezone: Option<String>,

    #[serde(default)]
    pub sync: SyncConfig,
}

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("tasksync"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load the config, writing a commented default file on first run.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            Self::create_default_config(&path)?;
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn create_default_config(path: &Path) -> Result<()> {
        let contents = format!(
            "\
# tasksync configuration

# Where the local task store lives:
# data_dir = \"{}\"

# Zone for due dates and start times (defaults to the system zone):
# timezone = \"Europe/Berlin\"

[sync]
# max_workers = 4
# request_timeout_secs = {}
# max_retries = {}
",
            DEFAULT_DATA_DIR,
            default_request_timeout(),
            default_max_retries()
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
        std::fs::write(path, contents)
            .with_context(|| format!("Could not write {}", path.display()))?;
        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir.to_string_lossy()).into_owned())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_path().join("store.json")
    }

    /// The configured zone, else the system zone, else UTC.
    pub fn zone(&self) -> Result<Tz> {
        if let Some(name) = &self.timezone {
            return name
                .parse::<Tz>()
                .map_err(|e| anyhow::anyhow!("Unknown timezone '{}': {}", name, e));
        }

        match iana_time_zone::get_timezone() {
            Ok(name) => Ok(name.parse::<Tz>().unwrap_or_else(|_| {
                log::warn!("System timezone {} is not known, using UTC", name);
                Tz::UTC
            })),
            Err(e) => {
                log::warn!("Could not determine system timezone ({}), using UTC", e);
                Ok(Tz::UTC)
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.sync.max_retries + 1,
            timeout: Duration::from_secs(self.sync.request_timeout_secs.max(1)),
            ..RetryPolicy::default()
        }
    }
}
