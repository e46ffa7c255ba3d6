use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::ops::Deref;
use std::sync::{Arc, LazyLock};
use tokio::sync::Notify;

use crate::config::AppConfig;
use crate::console::ConsoleClient;
use crate::directory::{Directory, DirectoryClient};
use crate::process::ServerProcess;
use crate::runtime::{GracefulShutdown, StatusPoller};
use crate::settings::JsonSettingsProvider;
use crate::supervisor::{StartOutcome, Supervisor, SupervisorContext};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
static START_TIME: LazyLock<DateTime<Utc>> = LazyLock::new(Utc::now);

pub struct ApplicationState {
    pub config: AppConfig,
    pub supervisor: Arc<Supervisor>,
    pub stop_notify: Arc<Notify>,
}
pub type AppState = Arc<ApplicationState>;

pub fn get_start_time() -> &'static DateTime<Utc> {
    START_TIME.deref()
}

fn init_app_state(config: AppConfig) -> anyhow::Result<AppState> {
    debug!(
        "config loaded: {}",
        serde_json::to_string_pretty(&config).unwrap_or_default()
    );

    let directory: Option<Arc<dyn Directory>> = if config.directory.enabled {
        let client = DirectoryClient::new(&config.directory)
            .context("failed to set up the directory client")?;
        Some(Arc::new(client))
    } else {
        info!("Directory registration disabled");
        None
    };

    let stop_notify = Arc::new(Notify::new());
    let context = SupervisorContext {
        config: config.supervisor.clone(),
        console_host: config.server.console_host,
        settings: Arc::new(JsonSettingsProvider::new(config.settings_path.clone())),
        console: Arc::new(ConsoleClient::new()),
        directory,
        stop_notify: stop_notify.clone(),
    };
    let process = Box::new(ServerProcess::new(config.server.clone()));
    let supervisor = Supervisor::new(context, process).with_context(|| {
        format!(
            "failed to load server settings from {}",
            config.settings_path.display()
        )
    })?;

    Ok(Arc::new(ApplicationState {
        config,
        supervisor: Arc::new(supervisor),
        stop_notify,
    }))
}

pub async fn run_app(config: AppConfig) -> anyhow::Result<()> {
    let _ = get_start_time();
    info!("astro daemon v{}", VERSION);

    let state = init_app_state(config)?;
    match state.supervisor.start().await? {
        StartOutcome::Launched(handle) => debug!("initial launch pid={}", handle.pid),
        StartOutcome::AlreadyRunning(current) => debug!("server already {}", current),
    }

    let mut gs = GracefulShutdown::new(state.supervisor.clone());
    gs.add_service(StatusPoller::new(state.supervisor.clone()));
    gs.watch(state.stop_notify.clone()).await;

    info!(
        "Bye. (up since {}, executable {})",
        get_start_time().format("%Y-%m-%d %H:%M:%S"),
        state.config.server.executable.display()
    );
    Ok(())
}
