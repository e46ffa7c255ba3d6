use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must not be 0")]
    ZeroPort(&'static str),
    #[error("Port and ConsolePort must differ (both {0})")]
    PortClash(u16),
    #[error("MaximumPlayerCount must be at least 1")]
    NoCapacity,
    #[error("HeartbeatInterval must be at least 1 second")]
    HeartbeatInterval,
}

/// Operational settings of the dedicated server.
///
/// Always replaced as a whole; nothing mutates a snapshot in place. Every key
/// must be present and unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServerSettings {
    #[serde(rename = "PublicIP")]
    pub public_ip: String,
    pub port: u16,
    pub console_port: u16,
    pub server_name: String,
    pub server_password: String,
    pub maximum_player_count: u32,
    pub owner_name: String,
    pub owner_guid: String,
    /// seconds
    pub player_activity_timeout: u64,
    /// seconds
    pub auto_save_game_interval: u64,
    /// seconds
    pub backup_save_games_interval: u64,
    pub server_guid: String,
    /// seconds
    pub heartbeat_interval: u64,
}

/// The part of the settings that is safe to show to anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSummary {
    pub public_ip: String,
    pub port: u16,
    pub server_name: String,
    pub maximum_player_count: u32,
    pub owner_name: String,
}

impl ServerSettings {
    /// Identity of this server in the directory service.
    pub fn address_key(&self) -> String {
        format!("{}:{}", self.public_ip, self.port)
    }

    pub fn has_password(&self) -> bool {
        !self.server_password.is_empty()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn summary(&self) -> SettingsSummary {
        SettingsSummary {
            public_ip: self.public_ip.clone(),
            port: self.port,
            server_name: self.server_name.clone(),
            maximum_player_count: self.maximum_player_count,
            owner_name: self.owner_name.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.public_ip.trim().is_empty() {
            return Err(SettingsError::Empty("PublicIP"));
        }
        if self.server_name.trim().is_empty() {
            return Err(SettingsError::Empty("ServerName"));
        }
        if self.port == 0 {
            return Err(SettingsError::ZeroPort("Port"));
        }
        if self.console_port == 0 {
            return Err(SettingsError::ZeroPort("ConsolePort"));
        }
        if self.port == self.console_port {
            return Err(SettingsError::PortClash(self.port));
        }
        if self.maximum_player_count == 0 {
            return Err(SettingsError::NoCapacity);
        }
        if self.heartbeat_interval == 0 {
            return Err(SettingsError::HeartbeatInterval);
        }
        Ok(())
    }
}
