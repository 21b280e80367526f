//! Credential storage for sync accounts.
//!
//! Stores one file per account at:
//!   ~/.config/tasksync/sessions/{account}.toml

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

pub fn base_dir() -> Result<PathBuf> {
    Ok(AppConfig::config_dir()?.join("sessions"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    CalDav {
        password: String,
    },
    Journal {
        /// API token issued for the login password
        token: String,
        /// Password-derived encryption key, base64
        encryption_key: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub account: String,
    pub credentials: Credentials,
}

impl Session {
    pub fn new(account: impl Into<String>, credentials: Credentials) -> Self {
        Session {
            account: account.into(),
            credentials,
        }
    }

    fn path_in(dir: &Path, account: &str) -> PathBuf {
        let slug = account.replace(['/', '\\', ':', '@', '.'], "_");
        dir.join(format!("{}.toml", slug))
    }

    pub fn load(account: &str) -> Result<Self> {
        Self::load_from(&base_dir()?, account)
    }

    pub fn load_from(dir: &Path, account: &str) -> Result<Self> {
        let path = Self::path_in(dir, account);
        if !path.exists() {
            anyhow::bail!("No credentials stored for {}", account);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse session from {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_in(&base_dir()?)
    }

    pub fn save_in(&self, dir: &Path) -> Result<()> {
        let path = Self::path_in(dir, &self.account);

        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize session")?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write session to {}", path.display()))?;

        // Owner-only, the file holds credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(())
    }

    pub fn remove(account: &str) -> Result<()> {
        Self::remove_from(&base_dir()?, account)
    }

    pub fn remove_from(dir: &Path, account: &str) -> Result<()> {
        let path = Self::path_in(dir, account);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
