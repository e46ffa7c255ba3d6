use crate::server::ServerSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A listing of this server in the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub lobby_id: String,
    pub address_key: String,
}

/// Every directory reply is wrapped in `{"data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameList {
    #[serde(default)]
    pub games: Vec<GameEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEntry {
    #[serde(rename = "LobbyID")]
    pub lobby_id: String,
    #[serde(rename = "Tags", default)]
    pub tags: HashMap<String, String>,
}

impl GameEntry {
    pub const ADDRESS_TAG: &'static str = "gameId";

    /// Converts the wire entry into a record, falling back to `queried` when the
    /// directory omitted the address tag.
    pub fn into_record(self, queried: &str) -> RegistrationRecord {
        let address_key = self
            .tags
            .get(Self::ADDRESS_TAG)
            .cloned()
            .unwrap_or_else(|| queried.to_owned());
        RegistrationRecord {
            lobby_id: self.lobby_id,
            address_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyCreated {
    #[serde(rename = "LobbyID")]
    pub lobby_id: String,
}

/// Body of register and heartbeat requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAdvertisement {
    pub game_id: String,
    pub server_name: String,
    pub max_players: u32,
    pub owner_name: String,
    pub has_password: bool,
}

impl From<&ServerSettings> for ServerAdvertisement {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            game_id: settings.address_key(),
            server_name: settings.server_name.clone(),
            max_players: settings.maximum_player_count,
            owner_name: settings.owner_name.clone(),
            has_password: settings.has_password(),
        }
    }
}
