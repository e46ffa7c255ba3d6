use serde::{Deserialize, Serialize};

/// Reply to `DSServerStatistics`.
///
/// The server adds fields between builds, so unknown keys are ignored and
/// every known key falls back to its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerStatistics {
    pub build: String,
    pub server_name: String,
    pub owner_name: String,
    pub max_in_game_players: u32,
    pub players_in_game: u32,
    pub players_known_to_game: u32,
    pub save_game_name: String,
    pub player_activity_timeout: u64,
    pub seconds_in_game: u64,
    #[serde(rename = "serverURL")]
    pub server_url: String,
    #[serde(rename = "averageFPS")]
    pub average_fps: f64,
    pub has_server_password: bool,
    pub is_enforcing_whitelist: bool,
    pub creative_mode: bool,
    pub is_achievement_progression_disabled: bool,
}
