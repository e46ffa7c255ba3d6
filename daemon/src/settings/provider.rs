use astro_protocol::server::{ServerSettings, SettingsError};
use log::debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(#[from] SettingsError),
}

/// Source of [`ServerSettings`] snapshots.
///
/// Called at construction and on explicit refresh, never from the polling loop.
pub trait SettingsProvider: Send + Sync {
    fn current_settings(&self) -> Result<ServerSettings, ConfigError>;
}

/// Reads the settings from a JSON document on every call.
pub struct JsonSettingsProvider {
    path: PathBuf,
}

impl JsonSettingsProvider {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsProvider for JsonSettingsProvider {
    fn current_settings(&self) -> Result<ServerSettings, ConfigError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        let settings: ServerSettings =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        settings.validate()?;
        debug!("settings loaded from {}", self.path.display());
        Ok(settings)
    }
}
