use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One entry of the `DSListPlayers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    #[serde(rename = "playerName")]
    pub name: String,
    #[serde(rename = "inGame")]
    pub in_game: bool,
    #[serde(rename = "playerGuid", default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(rename = "playerCategory", default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl PlayerRecord {
    pub fn new(name: impl Into<String>, in_game: bool) -> Self {
        Self {
            name: name.into(),
            in_game,
            guid: None,
            category: None,
        }
    }
}

/// Point-in-time view of the players known to the server.
///
/// A snapshot is only ever diffed against the previous one, never merged into it.
/// `playerInfo` is required: a reply without it is not a player list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    #[serde(rename = "playerInfo")]
    pub players: Vec<PlayerRecord>,
}

impl PlayerSnapshot {
    pub fn new(players: Vec<PlayerRecord>) -> Self {
        Self { players }
    }

    /// Names of the players currently in game.
    pub fn online_names(&self) -> BTreeSet<String> {
        self.players
            .iter()
            .filter(|p| p.in_game)
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
