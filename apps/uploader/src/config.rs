//! Uploader configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/bucketload/uploader.toml`
//! - Windows: `%APPDATA%/bucketload/uploader.toml`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bucketload_transfer::MAX_PENDING_SIZE;
use serde::{Deserialize, Serialize};

/// Uploader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Root URL of the upload service.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Server-side handler named in the begin request.
    #[serde(default = "default_upload_handler")]
    pub upload_handler: String,

    /// Repository folder to upload into (empty for the root).
    #[serde(default)]
    pub target_path: String,

    /// Cap on concurrently in-flight transfers.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Extra query parameters sent with the begin request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}

fn default_upload_handler() -> String {
    "default".into()
}

fn default_max_pending() -> usize {
    MAX_PENDING_SIZE
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            upload_handler: default_upload_handler(),
            target_path: String::new(),
            max_pending: default_max_pending(),
            params: BTreeMap::new(),
        }
    }
}

impl UploaderConfig {
    /// Loads configuration from `path` (or the platform default), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: UploaderConfig = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = UploaderConfig::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
pub fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("bucketload")
            .join("uploader.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("bucketload").join("uploader.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/bucketload/uploader.toml"))
    }
}
