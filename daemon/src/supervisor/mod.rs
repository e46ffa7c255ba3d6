mod busy;
mod presence;
mod registration;
mod state;
#[cfg(test)]
mod tests;

pub use busy::{BusyGate, BusyGuard};
pub use presence::PresenceDiff;
pub use state::RegistrationState;

use astro_protocol::console::PlayerSnapshot;
use astro_protocol::server::{AdminAck, ServerSettings, SupervisorState, SupervisorStatus};
use log::{debug, error, info, warn};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::console::{Console, ConsoleEndpoint, ConsoleError};
use crate::directory::Directory;
use crate::process::{LaunchError, ProcessControl, ProcessHandle};
use crate::settings::{ConfigError, SettingsProvider};
use state::Shared;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Collaborators and tunables handed to a [`Supervisor`] at construction.
pub struct SupervisorContext {
    pub config: SupervisorConfig,
    pub console_host: IpAddr,
    pub settings: Arc<dyn SettingsProvider>,
    pub console: Arc<dyn Console>,
    pub directory: Option<Arc<dyn Directory>>,
    /// notified once the daemon itself should exit
    pub stop_notify: Arc<Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Launched(ProcessHandle),
    AlreadyRunning(SupervisorState),
}

/// What a single polling cycle observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// nothing to poll, or the process is held by an administrative operation
    Idle,
    Exited,
    NotReady,
    Players(PresenceDiff),
    ConnectionFailed,
    ProtocolFailed,
}

/// Keeps one game server alive, tracks who is on it and mirrors it to the
/// directory service.
pub struct Supervisor {
    config: SupervisorConfig,
    console_host: IpAddr,
    settings_provider: Arc<dyn SettingsProvider>,
    console: Arc<dyn Console>,
    directory: Option<Arc<dyn Directory>>,
    stop_notify: Arc<Notify>,
    process: tokio::sync::Mutex<Box<dyn ProcessControl>>,
    shared: Mutex<Shared>,
    busy: BusyGate,
}

impl Supervisor {
    pub fn new(
        context: SupervisorContext,
        process: Box<dyn ProcessControl>,
    ) -> Result<Self, ConfigError> {
        let settings = context.settings.current_settings()?;
        info!(
            "Supervising \"{}\" at {}",
            settings.server_name,
            settings.address_key()
        );
        Ok(Self {
            config: context.config,
            console_host: context.console_host,
            settings_provider: context.settings,
            console: context.console,
            directory: context.directory,
            stop_notify: context.stop_notify,
            process: tokio::sync::Mutex::new(process),
            shared: Mutex::new(Shared::new(settings)),
            busy: BusyGate::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SupervisorState) {
        let mut shared = self.lock();
        if shared.state != state {
            info!("Server {} -> {}", shared.state, state);
            shared.state = state;
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    pub fn settings(&self) -> Arc<ServerSettings> {
        self.lock().settings.clone()
    }

    fn console_endpoint(&self) -> ConsoleEndpoint {
        ConsoleEndpoint {
            host: self.console_host,
            port: self.lock().settings.console_port,
            timeout: self.config.console_timeout(),
        }
    }

    /// Launches the server. Only allowed from `Stopped` or `Killed`.
    pub async fn start(&self) -> Result<StartOutcome, LaunchError> {
        {
            let mut shared = self.lock();
            if !matches!(
                shared.state,
                SupervisorState::Stopped | SupervisorState::Killed
            ) {
                warn!("Start requested while the server is {}", shared.state);
                return Ok(StartOutcome::AlreadyRunning(shared.state));
            }
            shared.begin_launch();
            shared.consecutive_restarts = 0;
        }
        info!("Starting server");
        let mut process = self.process.lock().await;
        self.launch(process.as_mut()).await.map(StartOutcome::Launched)
    }

    /// Expects the state to be `Starting` already.
    async fn launch(&self, process: &mut dyn ProcessControl) -> Result<ProcessHandle, LaunchError> {
        let result = process.start().await;
        let mut shared = self.lock();
        match &result {
            Ok(handle) => {
                shared.process = Some(handle.clone());
                shared.last_error = None;
            }
            Err(err) => {
                error!("Could not launch the server: {}", err);
                shared.state = SupervisorState::Stopped;
                shared.process = None;
                shared.last_error = Some(err.to_string());
            }
        }
        result
    }

    /// The polling loop. Never returns; stop it by dropping its task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = time::interval(self.config.status_frequency());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let outcome = self.poll_once().await;
            debug!("poll: {:?}", outcome);
        }
    }

    /// One cycle: liveness first, then the console.
    pub async fn poll_once(self: &Arc<Self>) -> PollOutcome {
        if !self.state().is_up() {
            return PollOutcome::Idle;
        }

        let alive = match self.process.try_lock() {
            Ok(mut process) => process.is_alive(),
            Err(_) => return PollOutcome::Idle,
        };
        if !alive {
            self.lock().process = None;
            self.on_process_exit().await;
            return PollOutcome::Exited;
        }
        {
            let mut shared = self.lock();
            if shared.state == SupervisorState::Starting {
                info!("Server {} -> {}", shared.state, SupervisorState::Running);
                shared.state = SupervisorState::Running;
            }
        }

        let endpoint = self.console_endpoint();
        match self.console.list_players(&endpoint).await {
            Ok(Some(snapshot)) => {
                let diff = self.apply_snapshot(snapshot);
                self.poll_statistics(&endpoint).await;
                self.sync_registration();
                PollOutcome::Players(diff)
            }
            Ok(None) => {
                debug!("console not ready yet");
                self.note_unreachable(None);
                PollOutcome::NotReady
            }
            Err(err) if err.is_connection() => {
                self.note_unreachable(Some(&err));
                PollOutcome::ConnectionFailed
            }
            Err(err) => {
                error!("Discarding player list: {}", err);
                PollOutcome::ProtocolFailed
            }
        }
    }

    fn apply_snapshot(&self, snapshot: PlayerSnapshot) -> PresenceDiff {
        let mut shared = self.lock();
        // a kill may have landed while the console call was running
        if !shared.state.is_up() {
            return PresenceDiff::default();
        }
        if !shared.console_ready {
            info!("Server console is answering");
            shared.console_ready = true;
            shared.consecutive_restarts = 0;
        }
        if shared.outage_reported {
            info!("Server console reachable again");
        }
        shared.failing_since = None;
        shared.outage_reported = false;

        let online = snapshot.online_names();
        let diff = PresenceDiff::between(&shared.presence, &online);
        for name in &diff.joined {
            info!("Player joining: {}", name);
        }
        for name in &diff.left {
            info!("Player leaving: {}", name);
        }
        shared.presence = online;
        shared.players = snapshot.players;
        diff
    }

    async fn poll_statistics(&self, endpoint: &ConsoleEndpoint) {
        match self.console.server_statistics(endpoint).await {
            Ok(Some(stats)) => {
                let mut shared = self.lock();
                if shared.state.is_up() {
                    shared.stats = Some(stats);
                }
            }
            Ok(None) => debug!("no statistics reply"),
            Err(err) => debug!("statistics unavailable: {}", err),
        }
    }

    /// Connection failures are expected while the server boots; they only
    /// become a warning once they outlast the grace period.
    fn note_unreachable(&self, err: Option<&ConsoleError>) {
        let mut shared = self.lock();
        let now = Instant::now();
        let since = *shared.failing_since.get_or_insert(now);
        if now.duration_since(since) >= self.config.boot_grace() && !shared.outage_reported {
            shared.outage_reported = true;
            match err {
                Some(err) => warn!("Server console unreachable for {:?}: {}", now - since, err),
                None => warn!("Server console not ready for {:?}", now - since),
            }
        } else if let Some(err) = err {
            debug!("console unreachable: {}", err);
        }
    }

    async fn on_process_exit(&self) {
        let Some(guard) = self.busy.try_acquire() else {
            info!("Server process exited during an administrative operation, not restarting");
            return;
        };
        self.restart_after_exit(guard).await;
    }

    async fn restart_after_exit(&self, _guard: BusyGuard) {
        let attempt = {
            let mut shared = self.lock();
            if !shared.state.is_up() {
                return;
            }
            if !self.config.restart.allows(shared.consecutive_restarts) {
                error!(
                    "Server exited {} times in a row without answering, giving up",
                    shared.consecutive_restarts + 1
                );
                shared.state = SupervisorState::Stopped;
                shared.last_error = Some(format!(
                    "restart limit reached after {} attempts",
                    shared.consecutive_restarts
                ));
                return;
            }
            shared.consecutive_restarts += 1;
            shared.state = SupervisorState::Restarting;
            shared.consecutive_restarts
        };
        warn!("Server process exited unexpectedly, restarting (attempt {})", attempt);

        let delay = self.config.restart.delay();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        let mut process = self.process.lock().await;
        self.lock().begin_launch();
        let _ = self.launch(process.as_mut()).await;
    }

    /// Asks the server to write its save game.
    pub async fn save_game(&self) -> AdminAck {
        match self.busy.try_acquire() {
            Some(guard) => self.save_game_with(guard).await,
            None => self.reject_busy("save"),
        }
    }

    async fn save_game_with(&self, _guard: BusyGuard) -> AdminAck {
        if !self.state().is_up() {
            warn!("Save requested while the server is {}", self.state());
            return AdminAck::Failed;
        }
        info!("Saving game");
        match self.console.save_game(&self.console_endpoint()).await {
            Ok(()) => AdminAck::Accepted,
            Err(err) => {
                warn!("Save failed: {}", err);
                AdminAck::Failed
            }
        }
    }

    /// Saves, shuts the server down gracefully and launches it again. The
    /// directory listing is kept.
    pub async fn save_and_shutdown(&self) -> AdminAck {
        match self.busy.try_acquire() {
            Some(guard) => self.save_and_shutdown_with(guard).await,
            None => self.reject_busy("restart"),
        }
    }

    async fn save_and_shutdown_with(&self, _guard: BusyGuard) -> AdminAck {
        if !self.state().is_up() {
            warn!("Restart requested while the server is {}", self.state());
            return AdminAck::Failed;
        }
        self.set_state(SupervisorState::Restarting);

        let endpoint = self.console_endpoint();
        if let Err(err) = self.console.save_game(&endpoint).await {
            warn!("Save before restart failed: {}", err);
        }
        if let Err(err) = self.console.shutdown_server(&endpoint).await {
            warn!("Shutdown command failed: {}", err);
        }

        let mut process = self.process.lock().await;
        let bound = self.config.shutdown_wait();
        if !Self::wait_for_exit(process.as_mut(), bound).await {
            warn!("Server still running after {:?}, killing it", bound);
            let report = process.kill_tree().await;
            if !report.is_clean() {
                warn!("Some server processes could not be killed: {:?}", report.failed);
            }
        }

        self.lock().begin_launch();
        match self.launch(process.as_mut()).await {
            Ok(_) => AdminAck::Accepted,
            Err(_) => AdminAck::Failed,
        }
    }

    async fn wait_for_exit(process: &mut dyn ProcessControl, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            if !process.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(EXIT_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    /// Removes every directory listing, kills the process tree and ends in
    /// `Killed`. Each step is best effort; the sequence always completes.
    ///
    /// With `self_terminate` the daemon is told to exit afterwards.
    pub async fn kill_server(&self, reason: &str, self_terminate: bool) -> AdminAck {
        match self.busy.try_acquire() {
            Some(guard) => self.kill_server_with(guard, reason, self_terminate).await,
            None => self.reject_busy("kill"),
        }
    }

    async fn kill_server_with(
        &self,
        _guard: BusyGuard,
        reason: &str,
        self_terminate: bool,
    ) -> AdminAck {
        info!("Killing server: {}", reason);
        self.set_state(SupervisorState::ShuttingDown);

        self.deregister_all().await;

        {
            let mut process = self.process.lock().await;
            let report = process.kill_tree().await;
            if !report.is_clean() {
                warn!("Some server processes could not be killed: {:?}", report.failed);
            }
        }

        {
            let mut shared = self.lock();
            info!("Server {} -> {}", shared.state, SupervisorState::Killed);
            shared.state = SupervisorState::Killed;
            shared.presence.clear();
            shared.players.clear();
            shared.process = None;
            shared.registration = RegistrationState::Unregistered;
            shared.console_ready = false;
        }

        if self_terminate {
            info!("Daemon exiting after kill");
            self.stop_notify.notify_one();
        }
        AdminAck::Accepted
    }

    fn reject_busy(&self, operation: &str) -> AdminAck {
        warn!("Refusing {}: another operation is in progress", operation);
        AdminAck::Busy
    }

    /// Dashboard entry: saves in the background.
    pub fn request_save(self: &Arc<Self>) -> AdminAck {
        let Some(guard) = self.busy.try_acquire() else {
            return self.reject_busy("save");
        };
        if !self.state().is_up() {
            return AdminAck::Failed;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.save_game_with(guard).await;
        });
        AdminAck::Accepted
    }

    /// Dashboard entry: save, graceful shutdown and relaunch in the background.
    pub fn request_restart(self: &Arc<Self>) -> AdminAck {
        let Some(guard) = self.busy.try_acquire() else {
            return self.reject_busy("restart");
        };
        if !self.state().is_up() {
            return AdminAck::Failed;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.save_and_shutdown_with(guard).await;
        });
        AdminAck::Accepted
    }

    /// Dashboard entry: kills the server and then the daemon.
    pub fn request_shutdown(self: &Arc<Self>, reason: impl Into<String>) -> AdminAck {
        let Some(guard) = self.busy.try_acquire() else {
            return self.reject_busy("shutdown");
        };
        let this = self.clone();
        let reason = reason.into();
        tokio::spawn(async move {
            this.kill_server_with(guard, &reason, true).await;
        });
        AdminAck::Accepted
    }

    /// Re-reads the settings; the previous snapshot stays on failure.
    pub fn refresh_settings(&self) -> Result<Arc<ServerSettings>, ConfigError> {
        let settings = Arc::new(self.settings_provider.current_settings()?);
        let mut shared = self.lock();
        if shared.settings.address_key() != settings.address_key() {
            info!(
                "Server address changed from {} to {}",
                shared.settings.address_key(),
                settings.address_key()
            );
        }
        shared.settings = settings.clone();
        Ok(settings)
    }

    pub fn status(&self) -> SupervisorStatus {
        let shared = self.lock();
        SupervisorStatus {
            state: shared.state,
            busy: self.busy.is_busy(),
            online_players: shared.presence.iter().cloned().collect(),
            players: shared.players.clone(),
            settings: shared.settings.summary(),
            lobby_id: shared.registration.lobby_id().map(str::to_owned),
            stats: shared.stats.clone(),
            pid: shared.process.as_ref().map(|p| p.pid),
            started_at: shared.process.as_ref().map(|p| p.started_at),
            last_error: shared.last_error.clone(),
        }
    }
}
