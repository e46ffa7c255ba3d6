use crate::console::{PlayerRecord, ServerStatistics};
use crate::server::SettingsSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    ShuttingDown,
    Killed,
}

impl SupervisorState {
    /// True while a server process is expected to exist.
    pub fn is_up(self) -> bool {
        matches!(self, SupervisorState::Starting | SupervisorState::Running)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
            SupervisorState::ShuttingDown => "shutting_down",
            SupervisorState::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Immediate answer to an administrative request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAck {
    Accepted,
    Busy,
    Failed,
}

/// Everything a dashboard needs to render the server page.
///
/// Reflects the last known good data; transient console or directory failures
/// never blank it out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub busy: bool,
    pub online_players: Vec<String>,
    pub players: Vec<PlayerRecord>,
    pub settings: SettingsSummary,
    pub lobby_id: Option<String>,
    pub stats: Option<ServerStatistics>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
