use astro_protocol::server::ServerSettings;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::Instant;

use super::state::RegistrationState;
use super::Supervisor;
use crate::directory::{Directory, DirectoryError};

impl Supervisor {
    /// Starts a register or heartbeat call in the background when one is due.
    ///
    /// Runs off the polling task; at most one directory call is in flight.
    pub(super) fn sync_registration(self: &Arc<Self>) {
        let Some(directory) = self.directory.clone() else {
            return;
        };
        let mut shared = self.lock();
        if !shared.state.is_up() || shared.directory_in_flight {
            return;
        }
        let settings = shared.settings.clone();
        match &shared.registration {
            RegistrationState::Unregistered => {
                shared.registration = RegistrationState::Registering;
                shared.directory_in_flight = true;
                tokio::spawn(self.clone().ensure_registered(directory, settings));
            }
            RegistrationState::Registered {
                lobby_id,
                next_heartbeat,
            } if Instant::now() >= *next_heartbeat => {
                let lobby_id = lobby_id.clone();
                shared.directory_in_flight = true;
                tokio::spawn(self.clone().heartbeat(directory, lobby_id, settings));
            }
            _ => {}
        }
    }

    async fn ensure_registered(
        self: Arc<Self>,
        directory: Arc<dyn Directory>,
        settings: Arc<ServerSettings>,
    ) {
        let result = Self::claim_listing(directory.as_ref(), &settings).await;

        let orphan = {
            let mut shared = self.lock();
            shared.directory_in_flight = false;
            match result {
                Ok(lobby_id) if shared.keeps_listing() => {
                    info!("Server listed in the directory (lobby={})", lobby_id);
                    shared.registration = RegistrationState::Registered {
                        lobby_id,
                        next_heartbeat: Instant::now() + settings.heartbeat_interval(),
                    };
                    None
                }
                Ok(lobby_id) => {
                    shared.registration = RegistrationState::Unregistered;
                    Some(lobby_id)
                }
                Err(err) => {
                    warn!("Could not register with the directory: {}", err);
                    shared.registration = RegistrationState::Unregistered;
                    None
                }
            }
        };

        // the server went down while the listing was being created
        if let Some(lobby_id) = orphan {
            match directory.deregister(&lobby_id).await {
                Ok(()) => info!("Removed listing {} of a stopped server", lobby_id),
                Err(err) => warn!("Could not remove listing {}: {}", lobby_id, err),
            }
        }
    }

    /// Adopts the first existing listing for this address and removes the
    /// others, or creates a new one when there is none.
    async fn claim_listing(
        directory: &dyn Directory,
        settings: &ServerSettings,
    ) -> Result<String, DirectoryError> {
        let mut records = directory
            .query_by_address(&settings.address_key())
            .await?;
        if records.is_empty() {
            return Ok(directory.register(settings).await?.lobby_id);
        }

        let active = records.remove(0);
        if !records.is_empty() {
            info!(
                "Found {} stale listings for {}, removing",
                records.len(),
                active.address_key
            );
        }
        for stale in records {
            if let Err(err) = directory.deregister(&stale.lobby_id).await {
                warn!("Could not remove stale listing {}: {}", stale.lobby_id, err);
            }
        }
        Ok(active.lobby_id)
    }

    async fn heartbeat(
        self: Arc<Self>,
        directory: Arc<dyn Directory>,
        lobby_id: String,
        settings: Arc<ServerSettings>,
    ) {
        let result = directory.heartbeat(&lobby_id, &settings).await;

        let mut shared = self.lock();
        shared.directory_in_flight = false;
        let current = shared.registration.lobby_id() == Some(lobby_id.as_str());
        match result {
            Ok(()) => {
                debug!("heartbeat sent for lobby={}", lobby_id);
                if let RegistrationState::Registered { next_heartbeat, .. } = &mut shared.registration {
                    if current {
                        *next_heartbeat = Instant::now() + settings.heartbeat_interval();
                    }
                }
            }
            Err(err) if err.is_not_found() => {
                warn!("Listing {} is gone from the directory, registering again", lobby_id);
                if current {
                    shared.registration = RegistrationState::Unregistered;
                }
            }
            // retried on the next poll
            Err(err) => warn!("Heartbeat for {} failed: {}", lobby_id, err),
        }
    }

    /// Removes every listing for this server's address, plus the one it
    /// believes is active. Returns how many were removed.
    pub(super) async fn deregister_all(&self) -> usize {
        let Some(directory) = self.directory.as_ref() else {
            return 0;
        };
        let (address_key, known) = {
            let shared = self.lock();
            (
                shared.settings.address_key(),
                shared.registration.lobby_id().map(str::to_owned),
            )
        };

        let mut lobby_ids = match directory.query_by_address(&address_key).await {
            Ok(records) => records.into_iter().map(|r| r.lobby_id).collect(),
            Err(err) => {
                warn!("Could not query directory listings for {}: {}", address_key, err);
                Vec::new()
            }
        };
        if let Some(known) = known {
            if !lobby_ids.contains(&known) {
                lobby_ids.push(known);
            }
        }

        let results = join_all(lobby_ids.iter().map(|id| directory.deregister(id))).await;
        let mut removed = 0;
        for (lobby_id, result) in lobby_ids.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(err) => warn!("Could not remove listing {}: {}", lobby_id, err),
            }
        }
        info!("Removed {} of {} directory listings", removed, lobby_ids.len());
        removed
    }
}
