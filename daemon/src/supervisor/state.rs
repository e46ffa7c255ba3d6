use astro_protocol::console::{PlayerRecord, ServerStatistics};
use astro_protocol::server::{ServerSettings, SupervisorState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::process::ProcessHandle;

/// Where this server stands with the directory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered {
        lobby_id: String,
        next_heartbeat: Instant,
    },
}

impl RegistrationState {
    pub fn lobby_id(&self) -> Option<&str> {
        match self {
            RegistrationState::Registered { lobby_id, .. } => Some(lobby_id),
            _ => None,
        }
    }
}

/// Everything the polling loop and the administrative tasks share.
///
/// Lives behind one lock that is never held across an await point.
#[derive(Debug)]
pub(super) struct Shared {
    pub state: SupervisorState,
    pub settings: Arc<ServerSettings>,
    pub presence: BTreeSet<String>,
    pub players: Vec<PlayerRecord>,
    pub stats: Option<ServerStatistics>,
    pub registration: RegistrationState,
    /// a register or heartbeat call is running
    pub directory_in_flight: bool,
    /// the console has answered since the last launch
    pub console_ready: bool,
    pub failing_since: Option<Instant>,
    pub outage_reported: bool,
    pub consecutive_restarts: u32,
    pub last_error: Option<String>,
    pub process: Option<ProcessHandle>,
}

impl Shared {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            state: SupervisorState::Stopped,
            settings: Arc::new(settings),
            presence: BTreeSet::new(),
            players: Vec::new(),
            stats: None,
            registration: RegistrationState::Unregistered,
            directory_in_flight: false,
            console_ready: false,
            failing_since: None,
            outage_reported: false,
            consecutive_restarts: 0,
            last_error: None,
            process: None,
        }
    }

    /// Resets what belongs to one run of the process. Presence and the
    /// directory listing survive a restart.
    pub fn begin_launch(&mut self) {
        self.state = SupervisorState::Starting;
        self.console_ready = false;
        self.failing_since = None;
        self.outage_reported = false;
        self.process = None;
    }

    /// A listing is worth keeping while the server runs or is being restarted.
    pub fn keeps_listing(&self) -> bool {
        self.state.is_up() || self.state == SupervisorState::Restarting
    }
}
