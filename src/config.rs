//! Application configuration loaded from `config.json`.
//!
//! The file provides the webhook endpoint, optional basic-auth credentials
//! and the folder recordings are written to. Anything missing or unparsable
//! falls back to defaults with a warning; only upload-dependent flows treat
//! a missing webhook URL as fatal.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Basic auth is applied only when both halves are present.
    pub fn is_configured(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote ingestion endpoint. Empty means uploads cannot run.
    pub webhook_url: String,

    pub credentials: Credentials,

    /// Folder all recordings and converted artifacts live in.
    pub watch_folder: PathBuf,

    /// Transcode captured WAVs to MP3 before upload.
    pub convert_to_mp3: bool,

    /// MP3 bitrate handed to the transcoder, e.g. "128k" or "192k".
    pub mp3_bitrate: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            credentials: Credentials::default(),
            watch_folder: default_watch_folder(),
            convert_to_mp3: false,
            mp3_bitrate: "192k".to_string(),
        }
    }
}

fn default_watch_folder() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meeting-recorder")
        .join("audio")
}

#[derive(Debug)]
pub enum ConfigError {
    MissingWebhookUrl,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingWebhookUrl => {
                write!(f, "webhook_url is not configured. Add it to config.json.")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("Config: failed to parse {:?}: {}", path, e);
                    Config::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config: {:?} not found, using defaults", path);
                Config::default()
            }
            Err(e) => {
                log::warn!("Config: failed to read {:?}: {}", path, e);
                Config::default()
            }
        }
    }

    /// Upload-dependent flows fail fast when no endpoint is configured.
    pub fn require_webhook_url(&self) -> Result<&str, ConfigError> {
        if self.webhook_url.is_empty() {
            Err(ConfigError::MissingWebhookUrl)
        } else {
            Ok(&self.webhook_url)
        }
    }
}
