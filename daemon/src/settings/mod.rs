mod provider;

pub use provider::{ConfigError, JsonSettingsProvider, SettingsProvider};
