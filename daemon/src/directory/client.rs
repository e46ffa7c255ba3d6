use astro_protocol::directory::{
    Envelope, GameList, LobbyCreated, RegistrationRecord, ServerAdvertisement,
};
use astro_protocol::server::ServerSettings;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::DirectoryConfig;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory answered {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("directory request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("undecodable directory reply: {0}")]
    Decode(String),
    #[error("invalid directory header {0}")]
    Header(String),
    #[error("invalid directory base URL {0}")]
    BaseUrl(String),
}

impl DirectoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DirectoryError::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

/// Remote registry that makes the server publicly discoverable.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Every listing for `address_key`; more than one means leftovers from an
    /// earlier abnormal exit.
    async fn query_by_address(
        &self,
        address_key: &str,
    ) -> Result<Vec<RegistrationRecord>, DirectoryError>;

    async fn register(&self, settings: &ServerSettings)
        -> Result<RegistrationRecord, DirectoryError>;

    async fn heartbeat(&self, lobby_id: &str, settings: &ServerSettings)
        -> Result<(), DirectoryError>;

    async fn deregister(&self, lobby_id: &str) -> Result<(), DirectoryError>;
}

pub struct DirectoryClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DirectoryClient {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DirectoryError::BaseUrl(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DirectoryError::BaseUrl(config.base_url.clone()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DirectoryError::Header(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| DirectoryError::Header(name.as_str().to_owned()))?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .build()
            .map_err(DirectoryError::Transport)?;

        Ok(Self { http, base_url })
    }

    /// Appends `segments` to the base path, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects bases that cannot carry a path
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn check(response: Response) -> Result<Response, DirectoryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let reason = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("unknown").to_owned()
        } else {
            body
        };
        Err(DirectoryError::Status {
            status: status.as_u16(),
            reason,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, DirectoryError> {
        let bytes = response.bytes().await.map_err(DirectoryError::Transport)?;
        serde_json::from_slice(&bytes).map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Directory for DirectoryClient {
    async fn query_by_address(
        &self,
        address_key: &str,
    ) -> Result<Vec<RegistrationRecord>, DirectoryError> {
        let response = self
            .http
            .get(self.url(&["servers"]))
            .query(&[("address", address_key)])
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        let envelope: Envelope<GameList> = Self::decode(Self::check(response).await?).await?;

        // the directory may repeat a lobby; treat the answer as a set
        let mut records: Vec<RegistrationRecord> = Vec::new();
        for game in envelope.data.games {
            if !records.iter().any(|r| r.lobby_id == game.lobby_id) {
                records.push(game.into_record(address_key));
            }
        }
        debug!("directory lists {} lobbies for {}", records.len(), address_key);
        Ok(records)
    }

    async fn register(
        &self,
        settings: &ServerSettings,
    ) -> Result<RegistrationRecord, DirectoryError> {
        let response = self
            .http
            .post(self.url(&["servers"]))
            .json(&ServerAdvertisement::from(settings))
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        let envelope: Envelope<LobbyCreated> = Self::decode(Self::check(response).await?).await?;
        Ok(RegistrationRecord {
            lobby_id: envelope.data.lobby_id,
            address_key: settings.address_key(),
        })
    }

    async fn heartbeat(
        &self,
        lobby_id: &str,
        settings: &ServerSettings,
    ) -> Result<(), DirectoryError> {
        let response = self
            .http
            .post(self.url(&["servers", lobby_id, "heartbeat"]))
            .json(&ServerAdvertisement::from(settings))
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn deregister(&self, lobby_id: &str) -> Result<(), DirectoryError> {
        let response = self
            .http
            .delete(self.url(&["servers", lobby_id]))
            .send()
            .await
            .map_err(DirectoryError::Transport)?;
        Self::check(response).await?;
        Ok(())
    }
}
