//! Configuration loading
//!
//! Read from `coven.toml` in the platform config directory unless a path is
//! given. Every section is optional.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use coven_net::{ChannelNames, DEFAULT_PORT};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Invalid relay address '{0}'")]
    InvalidRelay(String),
    #[error("Could not determine config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub log: LogConfig,
}

/// Remote store endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Address of the feed relay
    pub relay: String,
    pub game_channel: String,
    pub message_channel: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let names = ChannelNames::default();
        Self {
            relay: format!("127.0.0.1:{}", DEFAULT_PORT),
            game_channel: names.game,
            message_channel: names.messages,
        }
    }
}

impl FeedConfig {
    pub fn relay_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.relay
            .parse()
            .map_err(|_| ConfigError::InvalidRelay(self.relay.clone()))
    }

    pub fn channel_names(&self) -> ChannelNames {
        ChannelNames {
            game: self.game_channel.clone(),
            messages: self.message_channel.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from an explicit path. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Load from `path`, or from the default location.
    ///
    /// A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from(path);
        }
        let default = Self::default_path()?;
        if default.exists() {
            Self::load_from(&default)
        } else {
            tracing::debug!(path = %default.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("dev", "coven", "coven").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("coven.toml"))
    }
}
