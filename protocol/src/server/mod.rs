mod settings;
mod status;

pub use settings::{ServerSettings, SettingsError, SettingsSummary};
pub use status::{AdminAck, SupervisorState, SupervisorStatus};
