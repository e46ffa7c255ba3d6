use super::*;
use astro_protocol::console::{PlayerRecord, ServerStatistics};
use astro_protocol::directory::RegistrationRecord;
use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::collections::{BTreeSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::RestartPolicy;
use crate::directory::DirectoryError;
use crate::process::KillReport;

type Events = Arc<Mutex<Vec<String>>>;

fn record(events: &Events, event: impl Into<String>) {
    events.lock().unwrap().push(event.into());
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|n| n.to_string()).collect()
}

fn snapshot(online: &[&str]) -> PlayerSnapshot {
    PlayerSnapshot::new(online.iter().map(|n| PlayerRecord::new(*n, true)).collect())
}

fn timed_out() -> ConsoleError {
    ConsoleError::Timeout {
        addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1234)),
        timeout: Duration::from_millis(50),
    }
}

fn test_settings() -> ServerSettings {
    ServerSettings {
        public_ip: "203.0.113.7".to_owned(),
        port: 7777,
        console_port: 1234,
        server_name: "Moon Base".to_owned(),
        server_password: String::new(),
        maximum_player_count: 8,
        owner_name: "Alice".to_owned(),
        owner_guid: String::new(),
        player_activity_timeout: 0,
        auto_save_game_interval: 900,
        backup_save_games_interval: 7200,
        server_guid: String::new(),
        heartbeat_interval: 55,
    }
}

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        status_frequency_ms: 10,
        console_timeout_ms: 50,
        boot_grace_secs: 0,
        shutdown_wait_secs: 0,
        restart: RestartPolicy::default(),
    }
}

struct FixedSettings(Mutex<ServerSettings>);

impl SettingsProvider for FixedSettings {
    fn current_settings(&self) -> Result<ServerSettings, ConfigError> {
        let settings = self.0.lock().unwrap().clone();
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Default)]
struct FakeConsole {
    replies: Mutex<VecDeque<Result<Option<PlayerSnapshot>, ConsoleError>>>,
    fail_save: AtomicBool,
    events: Events,
}

impl FakeConsole {
    fn reply(&self, reply: Result<Option<PlayerSnapshot>, ConsoleError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn online(&self, players: &[&str]) {
        self.reply(Ok(Some(snapshot(players))));
    }

    /// Decodes `text` the way the console client does.
    fn raw(&self, text: &str) {
        self.reply(
            serde_json::from_str::<PlayerSnapshot>(text)
                .map(Some)
                .map_err(|e| ConsoleError::Protocol {
                    command: "DSListPlayers",
                    reason: e.to_string(),
                }),
        );
    }
}

#[async_trait]
impl Console for FakeConsole {
    async fn list_players(
        &self,
        endpoint: &ConsoleEndpoint,
    ) -> Result<Option<PlayerSnapshot>, ConsoleError> {
        assert_eq!(endpoint.port, 1234);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(timed_out()))
    }

    async fn server_statistics(
        &self,
        _endpoint: &ConsoleEndpoint,
    ) -> Result<Option<ServerStatistics>, ConsoleError> {
        Ok(Some(ServerStatistics {
            build: "1.8.0".to_owned(),
            ..ServerStatistics::default()
        }))
    }

    async fn save_game(&self, _endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError> {
        record(&self.events, "save");
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(timed_out());
        }
        Ok(())
    }

    async fn shutdown_server(&self, _endpoint: &ConsoleEndpoint) -> Result<(), ConsoleError> {
        record(&self.events, "shutdown");
        Ok(())
    }
}

struct FakeProcess {
    alive: Arc<AtomicBool>,
    starts: Arc<AtomicU32>,
    fail_start: Arc<AtomicBool>,
    handle: Option<ProcessHandle>,
    events: Events,
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn start(&mut self) -> Result<ProcessHandle, LaunchError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(LaunchError::Missing(PathBuf::from("AstroServer.exe")));
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        self.alive.store(true, Ordering::SeqCst);
        record(&self.events, "start");
        let handle = ProcessHandle {
            pid: 1000 + n,
            started_at: Utc::now(),
        };
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn is_alive(&mut self) -> bool {
        let alive = self.alive.load(Ordering::SeqCst);
        if !alive {
            self.handle = None;
        }
        alive
    }

    async fn kill_tree(&mut self) -> KillReport {
        record(&self.events, "kill");
        self.alive.store(false, Ordering::SeqCst);
        KillReport {
            killed: self.handle.take().map(|h| h.pid).into_iter().collect(),
            failed: vec![],
        }
    }

    fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }
}

#[derive(Default)]
struct FakeDirectory {
    listings: Mutex<Vec<RegistrationRecord>>,
    next_id: AtomicU32,
    heartbeat_status: Mutex<Option<u16>>,
    hold_register: Mutex<Option<Arc<Notify>>>,
    /// every query, register and deregister answers with this status
    failing: Mutex<Option<u16>>,
    events: Events,
}

impl FakeDirectory {
    fn list(&self, lobby_id: &str, address_key: &str) {
        self.listings.lock().unwrap().push(RegistrationRecord {
            lobby_id: lobby_id.to_owned(),
            address_key: address_key.to_owned(),
        });
    }

    fn fail_with(&self, status: Option<u16>) {
        *self.failing.lock().unwrap() = status;
    }

    fn check(&self) -> Result<(), DirectoryError> {
        match *self.failing.lock().unwrap() {
            Some(status) => Err(DirectoryError::Status {
                status,
                reason: "Service Unavailable".to_owned(),
            }),
            None => Ok(()),
        }
    }

    fn lobby_ids(&self) -> Vec<String> {
        let listings = self.listings.lock().unwrap();
        listings.iter().map(|r| r.lobby_id.clone()).collect()
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn query_by_address(
        &self,
        address_key: &str,
    ) -> Result<Vec<RegistrationRecord>, DirectoryError> {
        record(&self.events, "query");
        self.check()?;
        let listings = self.listings.lock().unwrap();
        Ok(listings
            .iter()
            .filter(|r| r.address_key == address_key)
            .cloned()
            .collect())
    }

    async fn register(
        &self,
        settings: &ServerSettings,
    ) -> Result<RegistrationRecord, DirectoryError> {
        let hold = self.hold_register.lock().unwrap().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        record(&self.events, "try register");
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let lobby_id = format!("lobby-{}", id);
        record(&self.events, format!("register {}", lobby_id));
        self.list(&lobby_id, &settings.address_key());
        Ok(RegistrationRecord {
            lobby_id,
            address_key: settings.address_key(),
        })
    }

    async fn heartbeat(
        &self,
        lobby_id: &str,
        _settings: &ServerSettings,
    ) -> Result<(), DirectoryError> {
        record(&self.events, format!("heartbeat {}", lobby_id));
        match *self.heartbeat_status.lock().unwrap() {
            Some(status) => Err(DirectoryError::Status {
                status,
                reason: "Not Found".to_owned(),
            }),
            None => Ok(()),
        }
    }

    async fn deregister(&self, lobby_id: &str) -> Result<(), DirectoryError> {
        record(&self.events, format!("deregister {}", lobby_id));
        self.check()?;
        self.listings.lock().unwrap().retain(|r| r.lobby_id != lobby_id);
        Ok(())
    }
}

struct Harness {
    supervisor: Arc<Supervisor>,
    settings: Arc<FixedSettings>,
    console: Arc<FakeConsole>,
    directory: Arc<FakeDirectory>,
    alive: Arc<AtomicBool>,
    starts: Arc<AtomicU32>,
    fail_start: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    events: Events,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: SupervisorConfig) -> Self {
        let events = Events::default();
        let settings = Arc::new(FixedSettings(Mutex::new(test_settings())));
        let console = Arc::new(FakeConsole {
            events: events.clone(),
            ..FakeConsole::default()
        });
        let directory = Arc::new(FakeDirectory {
            events: events.clone(),
            ..FakeDirectory::default()
        });
        let alive = Arc::new(AtomicBool::new(false));
        let starts = Arc::new(AtomicU32::new(0));
        let fail_start = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        let process = FakeProcess {
            alive: alive.clone(),
            starts: starts.clone(),
            fail_start: fail_start.clone(),
            handle: None,
            events: events.clone(),
        };
        let context = SupervisorContext {
            config,
            console_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            settings: settings.clone(),
            console: console.clone(),
            directory: Some(directory.clone()),
            stop_notify: stop_notify.clone(),
        };
        let supervisor = Arc::new(Supervisor::new(context, Box::new(process)).unwrap());

        Self {
            supervisor,
            settings,
            console,
            directory,
            alive,
            starts,
            fail_start,
            stop_notify,
            events,
        }
    }

    /// Started and past the first liveness check.
    async fn running() -> Self {
        let harness = Self::new();
        harness.supervisor.start().await.unwrap();
        harness.console.reply(Ok(None));
        assert_eq!(harness.supervisor.poll_once().await, PollOutcome::NotReady);
        assert_eq!(harness.supervisor.state(), SupervisorState::Running);
        harness
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn presence(&self) -> BTreeSet<String> {
        self.supervisor.status().online_players.into_iter().collect()
    }

    async fn until(&self, what: &str, check: impl Fn(&Supervisor) -> bool) {
        for _ in 0..200 {
            if check(&self.supervisor) {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn registered(&self) -> String {
        self.until("registration", |s| s.status().lobby_id.is_some())
            .await;
        self.supervisor.status().lobby_id.unwrap()
    }
}

#[tokio::test]
async fn start_then_first_alive_poll_is_running() {
    let harness = Harness::new();
    let outcome = harness.supervisor.start().await.unwrap();
    assert!(matches!(outcome, StartOutcome::Launched(ref h) if h.pid == 1001));
    assert_eq!(harness.supervisor.state(), SupervisorState::Starting);
    assert_eq!(harness.supervisor.status().pid, Some(1001));

    harness.console.online(&[]);
    assert_eq!(
        harness.supervisor.poll_once().await,
        PollOutcome::Players(PresenceDiff::default())
    );
    assert_eq!(harness.supervisor.state(), SupervisorState::Running);
}

#[tokio::test]
async fn start_while_running_is_rejected() {
    let harness = Harness::running().await;
    assert_eq!(
        harness.supervisor.start().await.unwrap(),
        StartOutcome::AlreadyRunning(SupervisorState::Running)
    );
    assert_eq!(harness.starts(), 1);
}

#[tokio::test]
async fn stopped_supervisor_does_not_poll() {
    let harness = Harness::new();
    harness.console.online(&["A"]);
    assert_eq!(harness.supervisor.poll_once().await, PollOutcome::Idle);
    assert!(harness.presence().is_empty());
}

#[tokio::test]
async fn presence_follows_the_latest_successful_poll() {
    let harness = Harness::running().await;
    let sup = &harness.supervisor;

    harness.console.online(&["A", "B"]);
    match sup.poll_once().await {
        PollOutcome::Players(diff) => assert_eq!(diff.joined, names(&["A", "B"])),
        other => panic!("unexpected {:?}", other),
    }

    harness.console.reply(Err(timed_out()));
    assert_eq!(sup.poll_once().await, PollOutcome::ConnectionFailed);
    assert_eq!(harness.presence(), names(&["A", "B"]));

    harness.console.reply(Err(ConsoleError::Protocol {
        command: "DSListPlayers",
        reason: "expected value at line 1 column 1".to_owned(),
    }));
    assert_eq!(sup.poll_once().await, PollOutcome::ProtocolFailed);
    assert_eq!(harness.presence(), names(&["A", "B"]));

    harness.console.reply(Ok(Some(PlayerSnapshot::new(vec![
        PlayerRecord::new("B", true),
        PlayerRecord::new("C", true),
        PlayerRecord::new("D", false),
    ]))));
    assert_eq!(
        sup.poll_once().await,
        PollOutcome::Players(PresenceDiff {
            joined: names(&["C"]),
            left: names(&["A"]),
        })
    );
    assert_eq!(harness.presence(), names(&["B", "C"]));
    assert_eq!(sup.status().players.len(), 3);
}

#[tokio::test]
async fn console_timeout_changes_nothing() {
    let harness = Harness::running().await;
    harness.console.online(&["A"]);
    harness.supervisor.poll_once().await;

    // the fake times out once its queue is empty
    for _ in 0..3 {
        assert_eq!(
            harness.supervisor.poll_once().await,
            PollOutcome::ConnectionFailed
        );
    }
    assert_eq!(harness.presence(), names(&["A"]));
    assert_eq!(harness.supervisor.state(), SupervisorState::Running);
    assert!(harness.supervisor.lock().outage_reported);
}

#[tokio::test]
async fn statistics_are_kept_with_the_player_list() {
    let harness = Harness::running().await;
    assert!(harness.supervisor.status().stats.is_none());
    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    let stats = harness.supervisor.status().stats.unwrap();
    assert_eq!(stats.build, "1.8.0");
}

#[tokio::test]
async fn exit_while_running_restarts() {
    let harness = Harness::running().await;
    harness.console.online(&["A"]);
    harness.supervisor.poll_once().await;

    harness.crash();
    assert_eq!(harness.supervisor.poll_once().await, PollOutcome::Exited);
    assert_eq!(harness.supervisor.state(), SupervisorState::Starting);
    assert_eq!(harness.starts(), 2);
    assert_eq!(harness.supervisor.status().pid, Some(1002));
    // a restart keeps the last known population
    assert_eq!(harness.presence(), names(&["A"]));
    assert!(!harness.supervisor.status().busy);
}

#[tokio::test]
async fn exit_while_busy_does_not_restart() {
    let harness = Harness::running().await;
    let guard = harness.supervisor.busy.try_acquire().unwrap();

    harness.crash();
    assert_eq!(harness.supervisor.poll_once().await, PollOutcome::Exited);
    assert_eq!(harness.starts(), 1);
    assert_eq!(harness.supervisor.state(), SupervisorState::Running);

    drop(guard);
    assert_eq!(harness.supervisor.poll_once().await, PollOutcome::Exited);
    assert_eq!(harness.starts(), 2);
    assert_eq!(harness.supervisor.state(), SupervisorState::Starting);
}

#[tokio::test]
async fn restart_limit_leaves_the_server_stopped() {
    let mut config = test_config();
    config.restart = RestartPolicy {
        max_consecutive: Some(1),
        delay_ms: 0,
    };
    let harness = Harness::with_config(config);
    harness.supervisor.start().await.unwrap();

    harness.crash();
    harness.supervisor.poll_once().await;
    assert_eq!(harness.starts(), 2);

    harness.crash();
    assert_eq!(harness.supervisor.poll_once().await, PollOutcome::Exited);
    assert_eq!(harness.starts(), 2);
    let status = harness.supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn answering_console_resets_the_restart_count() {
    let mut config = test_config();
    config.restart.max_consecutive = Some(1);
    let harness = Harness::with_config(config);
    harness.supervisor.start().await.unwrap();

    for expected_starts in 2..5 {
        harness.crash();
        harness.supervisor.poll_once().await;
        assert_eq!(harness.starts(), expected_starts);
        harness.console.online(&[]);
        harness.supervisor.poll_once().await;
    }
}

#[tokio::test]
async fn launch_failure_is_reported() {
    let harness = Harness::new();
    harness.fail_start.store(true, Ordering::SeqCst);
    let result = harness.supervisor.start().await;
    assert!(matches!(result, Err(LaunchError::Missing(_))));

    let status = harness.supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert!(status.last_error.unwrap().contains("AstroServer.exe"));
    assert!(!status.busy);
}

#[tokio::test]
async fn kill_deregisters_every_stale_listing_before_killing() {
    let harness = Harness::running().await;
    for id in ["old-1", "old-2", "old-3"] {
        harness.directory.list(id, "203.0.113.7:7777");
    }
    harness.directory.list("elsewhere", "198.51.100.1:7777");

    let ack = harness.supervisor.kill_server("operator request", false).await;
    assert_eq!(ack, AdminAck::Accepted);

    let events = harness.events();
    let kill_at = events.iter().position(|e| e == "kill").unwrap();
    let deregistered: Vec<_> = events[..kill_at]
        .iter()
        .filter(|e| e.starts_with("deregister"))
        .collect();
    assert_eq!(deregistered.len(), 3);
    assert_eq!(harness.directory.lobby_ids(), vec!["elsewhere".to_string()]);

    let status = harness.supervisor.status();
    assert_eq!(status.state, SupervisorState::Killed);
    assert!(status.online_players.is_empty());
    assert!(status.pid.is_none());
    assert!(!status.busy);
}

#[tokio::test]
async fn server_can_be_started_again_after_a_kill() {
    let harness = Harness::running().await;
    harness.supervisor.kill_server("maintenance", false).await;
    let outcome = harness.supervisor.start().await.unwrap();
    assert!(matches!(outcome, StartOutcome::Launched(_)));
    assert_eq!(harness.starts(), 2);
}

#[tokio::test]
async fn busy_is_cleared_after_every_operation() {
    let harness = Harness::new();
    // not running yet
    assert_eq!(harness.supervisor.save_game().await, AdminAck::Failed);
    assert!(!harness.supervisor.status().busy);

    harness.supervisor.start().await.unwrap();
    harness.console.fail_save.store(true, Ordering::SeqCst);
    assert_eq!(harness.supervisor.save_game().await, AdminAck::Failed);
    assert!(!harness.supervisor.status().busy);

    harness.console.fail_save.store(false, Ordering::SeqCst);
    assert_eq!(harness.supervisor.save_game().await, AdminAck::Accepted);
    assert!(!harness.supervisor.status().busy);

    assert_eq!(
        harness.supervisor.save_and_shutdown().await,
        AdminAck::Accepted
    );
    assert!(!harness.supervisor.status().busy);

    assert_eq!(
        harness.supervisor.kill_server("done", false).await,
        AdminAck::Accepted
    );
    assert!(!harness.supervisor.status().busy);
}

#[tokio::test]
async fn operations_are_refused_while_busy() {
    let harness = Harness::running().await;
    let _guard = harness.supervisor.busy.try_acquire().unwrap();

    assert_eq!(harness.supervisor.save_game().await, AdminAck::Busy);
    assert_eq!(harness.supervisor.request_restart(), AdminAck::Busy);
    assert_eq!(harness.supervisor.request_shutdown("dashboard"), AdminAck::Busy);
    assert_eq!(
        harness.supervisor.kill_server("Ctrl+C", false).await,
        AdminAck::Busy
    );
    assert_eq!(harness.supervisor.state(), SupervisorState::Running);
    assert!(!harness.events().iter().any(|e| e == "kill" || e == "save"));
}

#[tokio::test]
async fn save_and_shutdown_forces_a_stuck_server_down_and_relaunches() {
    let harness = Harness::running().await;
    assert_eq!(
        harness.supervisor.save_and_shutdown().await,
        AdminAck::Accepted
    );
    assert_eq!(
        harness.events(),
        vec!["start", "save", "shutdown", "kill", "start"]
    );
    assert_eq!(harness.supervisor.state(), SupervisorState::Starting);
    // a restart never touches the directory
    assert!(!harness.events().iter().any(|e| e == "query"));
}

#[tokio::test]
async fn request_restart_runs_in_the_background() {
    let harness = Harness::running().await;
    assert_eq!(harness.supervisor.request_restart(), AdminAck::Accepted);
    harness
        .until("relaunch", |s| s.status().pid == Some(1002) && !s.status().busy)
        .await;
    assert_eq!(harness.starts(), 2);
}

#[tokio::test]
async fn request_save_is_acknowledged_immediately() {
    let harness = Harness::running().await;
    assert_eq!(harness.supervisor.request_save(), AdminAck::Accepted);
    harness.until("save", |s| !s.status().busy).await;
    assert!(harness.events().iter().any(|e| e == "save"));
}

#[tokio::test]
async fn request_shutdown_kills_and_stops_the_daemon() {
    let harness = Harness::running().await;
    assert_eq!(
        harness.supervisor.request_shutdown("dashboard"),
        AdminAck::Accepted
    );
    time::timeout(Duration::from_secs(1), harness.stop_notify.notified())
        .await
        .expect("daemon was not told to stop");
    assert_eq!(harness.supervisor.state(), SupervisorState::Killed);
}

#[tokio::test]
async fn registers_once_the_console_answers() {
    let harness = Harness::running().await;
    assert!(!harness.events().iter().any(|e| e == "query"));

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    assert_eq!(harness.registered().await, "lobby-1");

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    let registrations = harness
        .events()
        .iter()
        .filter(|e| e.starts_with("register"))
        .count();
    assert_eq!(registrations, 1);
}

#[tokio::test]
async fn adopts_the_first_listing_and_removes_the_rest() {
    let harness = Harness::running().await;
    harness.directory.list("crash-1", "203.0.113.7:7777");
    harness.directory.list("crash-2", "203.0.113.7:7777");

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    assert_eq!(harness.registered().await, "crash-1");
    assert_eq!(harness.directory.lobby_ids(), vec!["crash-1".to_string()]);
    assert!(!harness.events().iter().any(|e| e.starts_with("register")));
}

#[tokio::test]
async fn missing_listing_on_heartbeat_registers_again() {
    let harness = Harness::running().await;
    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    harness.registered().await;

    *harness.directory.heartbeat_status.lock().unwrap() = Some(404);
    harness.directory.listings.lock().unwrap().clear();
    if let RegistrationState::Registered { next_heartbeat, .. } =
        &mut harness.supervisor.lock().registration
    {
        *next_heartbeat = Instant::now();
    }

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    harness
        .until("heartbeat", |s| {
            let shared = s.lock();
            !shared.directory_in_flight && shared.registration == RegistrationState::Unregistered
        })
        .await;
    assert!(harness.events().contains(&"heartbeat lobby-1".to_string()));

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    assert_eq!(harness.registered().await, "lobby-2");
}

#[tokio::test]
async fn restart_keeps_the_listing() {
    let harness = Harness::running().await;
    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    let lobby_id = harness.registered().await;

    harness.crash();
    harness.supervisor.poll_once().await;
    assert_eq!(harness.supervisor.status().lobby_id, Some(lobby_id));
    assert!(!harness.events().iter().any(|e| e.starts_with("deregister")));
}

#[tokio::test]
async fn listing_created_during_a_kill_is_removed() {
    let harness = Harness::running().await;
    let hold = Arc::new(Notify::new());
    *harness.directory.hold_register.lock().unwrap() = Some(hold.clone());

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    harness
        .until("register call", |_| {
            harness.events().iter().filter(|e| *e == "query").count() == 1
        })
        .await;

    harness.supervisor.kill_server("Ctrl+C", false).await;
    hold.notify_one();

    harness
        .until("orphan removal", |_| {
            harness.events().contains(&"deregister lobby-1".to_string())
        })
        .await;
    assert!(harness.directory.lobby_ids().is_empty());
    assert_eq!(harness.supervisor.status().lobby_id, None);
}

#[tokio::test]
async fn refresh_replaces_the_settings_snapshot() {
    let harness = Harness::new();
    harness.settings.0.lock().unwrap().server_name = "Mars Base".to_owned();
    let settings = harness.supervisor.refresh_settings().unwrap();
    assert_eq!(settings.server_name, "Mars Base");
    assert_eq!(harness.supervisor.status().settings.server_name, "Mars Base");

    harness.settings.0.lock().unwrap().server_name = String::new();
    assert!(harness.supervisor.refresh_settings().is_err());
    assert_eq!(harness.supervisor.settings().server_name, "Mars Base");
}

#[tokio::test]
async fn reply_without_player_list_leaves_presence_alone() {
    let harness = Harness::running().await;
    harness.console.online(&["A", "B"]);
    harness.supervisor.poll_once().await;

    harness.console.raw(r#"{"status":"Unknown command"}"#);
    assert_eq!(
        harness.supervisor.poll_once().await,
        PollOutcome::ProtocolFailed
    );
    harness.console.raw("{}");
    assert_eq!(
        harness.supervisor.poll_once().await,
        PollOutcome::ProtocolFailed
    );
    assert_eq!(harness.presence(), names(&["A", "B"]));

    harness.console.raw(r#"{"playerInfo":[]}"#);
    assert_eq!(
        harness.supervisor.poll_once().await,
        PollOutcome::Players(PresenceDiff {
            joined: BTreeSet::new(),
            left: names(&["A", "B"]),
        })
    );
}

#[tokio::test]
async fn kill_completes_while_the_directory_is_down() {
    let harness = Harness::running().await;
    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    let lobby_id = harness.registered().await;
    harness.directory.list("old-1", "203.0.113.7:7777");

    harness.directory.fail_with(Some(503));
    let ack = harness.supervisor.kill_server("operator request", false).await;
    assert_eq!(ack, AdminAck::Accepted);

    let events = harness.events();
    let kill_at = events.iter().position(|e| e == "kill").unwrap();
    // the query failed, the known listing is still attempted
    assert!(events[..kill_at].contains(&format!("deregister {}", lobby_id)));
    assert!(!harness.alive.load(Ordering::SeqCst));

    let status = harness.supervisor.status();
    assert_eq!(status.state, SupervisorState::Killed);
    assert_eq!(status.lobby_id, None);
    assert!(!status.busy);
}

#[tokio::test]
async fn failed_registration_is_retried_on_the_next_poll() {
    let harness = Harness::running().await;
    harness.directory.fail_with(Some(503));

    harness.console.online(&["A"]);
    assert!(matches!(
        harness.supervisor.poll_once().await,
        PollOutcome::Players(_)
    ));
    harness
        .until("failed registration", |s| {
            let shared = s.lock();
            !shared.directory_in_flight && shared.registration == RegistrationState::Unregistered
        })
        .await;
    assert_eq!(harness.supervisor.state(), SupervisorState::Running);
    assert_eq!(harness.presence(), names(&["A"]));

    harness.directory.fail_with(None);
    harness.console.online(&["A"]);
    harness.supervisor.poll_once().await;
    assert_eq!(harness.registered().await, "lobby-1");
}

#[tokio::test]
async fn failed_register_call_after_query_is_retried() {
    let harness = Harness::running().await;
    let hold = Arc::new(Notify::new());
    *harness.directory.hold_register.lock().unwrap() = Some(hold.clone());

    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    harness
        .until("query", |_| harness.events().iter().any(|e| e == "query"))
        .await;
    harness.directory.fail_with(Some(500));
    hold.notify_one();
    harness
        .until("failed register", |s| !s.lock().directory_in_flight)
        .await;
    assert!(harness.events().contains(&"try register".to_string()));
    assert_eq!(harness.supervisor.status().lobby_id, None);

    *harness.directory.hold_register.lock().unwrap() = None;
    harness.directory.fail_with(None);
    harness.console.online(&[]);
    harness.supervisor.poll_once().await;
    assert_eq!(harness.registered().await, "lobby-1");
}
