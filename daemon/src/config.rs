use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::{Config, FileIoWithBackup};

/// Daemon side configuration, read once at startup and handed down explicitly.
///
/// The game's own settings live in [`AppConfig::settings_path`] and are read
/// through a [`crate::settings::SettingsProvider`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub log_level: String,
    pub settings_path: PathBuf,
    pub server: ServerLaunchConfig,
    pub supervisor: SupervisorConfig,
    pub directory: DirectoryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            settings_path: PathBuf::from("server_settings.json"),
            server: ServerLaunchConfig::default(),
            supervisor: SupervisorConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl FileIoWithBackup for AppConfig {}

impl Config for AppConfig {
    type ConfigType = AppConfig;
}

impl AppConfig {
    pub const FILE_NAME: &'static str = "daemon.json";

    pub fn load() -> anyhow::Result<AppConfig> {
        let config = Self::load_config_or_default(Self::FILE_NAME, Self::default)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.supervisor.status_frequency_ms == 0 {
            bail!("supervisor.status_frequency_ms must not be 0");
        }
        if self.supervisor.console_timeout_ms == 0 {
            bail!("supervisor.console_timeout_ms must not be 0");
        }
        if self.directory.enabled && self.directory.base_url.trim().is_empty() {
            bail!("directory.base_url is required while the directory is enabled");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerLaunchConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// defaults to the executable's directory
    pub working_dir: Option<PathBuf>,
    pub console_host: IpAddr,
}

impl Default for ServerLaunchConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("AstroServer.exe"),
            args: vec!["-log".to_owned()],
            working_dir: None,
            console_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub status_frequency_ms: u64,
    pub console_timeout_ms: u64,
    /// how long the console may stay unreachable before it is reported as a warning
    pub boot_grace_secs: u64,
    /// bound on waiting for a graceful shutdown before the tree is killed
    pub shutdown_wait_secs: u64,
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            status_frequency_ms: 2000,
            console_timeout_ms: 2000,
            boot_grace_secs: 120,
            shutdown_wait_secs: 60,
            restart: RestartPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn status_frequency(&self) -> Duration {
        Duration::from_millis(self.status_frequency_ms)
    }

    pub fn console_timeout(&self) -> Duration {
        Duration::from_millis(self.console_timeout_ms)
    }

    pub fn boot_grace(&self) -> Duration {
        Duration::from_secs(self.boot_grace_secs)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }
}

/// What happens when the server exits on its own.
///
/// The default restarts forever without delay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RestartPolicy {
    /// restarts allowed before the console has answered once; `None` is unlimited
    pub max_consecutive: Option<u32>,
    pub delay_ms: u64,
}

impl RestartPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn allows(&self, consecutive: u32) -> bool {
        match self.max_consecutive {
            Some(max) => consecutive < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// sent with every request, e.g. the authorization header
    pub headers: BTreeMap<String, String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            request_timeout_ms: 10_000,
            headers: BTreeMap::new(),
        }
    }
}

impl DirectoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_is_filled_with_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"supervisor": {"status_frequency_ms": 500}, "directory": {"enabled": true, "base_url": "http://127.0.0.1:9000"}}"#,
        )
        .unwrap();
        assert_eq!(config.supervisor.status_frequency(), Duration::from_millis(500));
        assert_eq!(config.supervisor.console_timeout(), Duration::from_secs(2));
        assert_eq!(config.server.args, vec!["-log".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_json::from_str::<AppConfig>(r#"{"web_server_port": 80}"#).is_err());
    }

    #[test]
    fn enabled_directory_needs_a_base_url() {
        let mut config = AppConfig::default();
        config.directory.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn restart_policy_limits() {
        assert!(RestartPolicy::default().allows(u32::MAX));
        let policy = RestartPolicy {
            max_consecutive: Some(2),
            delay_ms: 0,
        };
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }
}
