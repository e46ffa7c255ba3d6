use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::select;
use tokio::time;

use super::helper::ProcessHelper;
use crate::config::ServerLaunchConfig;

/// How long a killed process gets to be reaped before it is given up on.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// The live server process. Dropped by its controller as soon as the
/// process is seen dead or killed, so holding one means it was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("server executable {0} not found")]
    Missing(PathBuf),
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("server process already running (pid={0})")]
    AlreadyRunning(u32),
}

/// Outcome of a tree kill. Failures never stop the sequence, they are only collected.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillReport {
    pub killed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl KillReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owner of the one server process.
#[async_trait]
pub trait ProcessControl: Send {
    async fn start(&mut self) -> Result<ProcessHandle, LaunchError>;

    /// Non-blocking exit check. Forgets the handle once the process is gone.
    fn is_alive(&mut self) -> bool;

    /// Kills every descendant and then the process itself.
    async fn kill_tree(&mut self) -> KillReport;

    fn handle(&self) -> Option<&ProcessHandle>;
}

pub struct ServerProcess {
    config: ServerLaunchConfig,
    child: Option<Child>,
    handle: Option<ProcessHandle>,
}

impl ServerProcess {
    pub fn new(config: ServerLaunchConfig) -> Self {
        Self {
            config,
            child: None,
            handle: None,
        }
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.config.working_dir.clone().or_else(|| {
            self.config
                .executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }

    fn forget(&mut self) {
        self.child = None;
        self.handle = None;
    }

    /// Waits for `child` to exit, at most `limit`.
    async fn reap_within(child: &mut Child, limit: Duration) -> Result<ExitStatus, String> {
        match time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("still running {:?} after the kill", limit)),
        }
    }

    /// Mirrors the server's stdout/stderr into the daemon log.
    fn forward_output(child: &mut Child, pid: u32) {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return;
        };
        tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout).lines();
            let mut stderr = BufReader::new(stderr).lines();
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                select! {
                    line = stdout.next_line(), if !out_done => match line {
                        Ok(Some(line)) => debug!(target: "server", "{}", line),
                        _ => out_done = true,
                    },
                    line = stderr.next_line(), if !err_done => match line {
                        Ok(Some(line)) => debug!(target: "server", "[STDERR] {}", line),
                        _ => err_done = true,
                    },
                }
            }
            debug!("output of pid={} closed", pid);
        });
    }
}

#[async_trait]
impl ProcessControl for ServerProcess {
    async fn start(&mut self) -> Result<ProcessHandle, LaunchError> {
        if self.is_alive() {
            if let Some(handle) = &self.handle {
                return Err(LaunchError::AlreadyRunning(handle.pid));
            }
        }

        let executable = self.config.executable.clone();
        // bare names are looked up through PATH by the OS
        if executable.components().count() > 1 && !executable.is_file() {
            return Err(LaunchError::Missing(executable));
        }

        let mut cmd = Command::new(&executable);
        cmd.args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LaunchError::Missing(executable.clone()),
            _ => LaunchError::Spawn {
                path: executable.clone(),
                source,
            },
        })?;
        let pid = child.id().unwrap_or(0);
        Self::forward_output(&mut child, pid);

        let handle = ProcessHandle {
            pid,
            started_at: Utc::now(),
        };
        info!("Server process started (pid={})", pid);
        self.child = Some(child);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("Server process exited with {}", status);
                self.forget();
                false
            }
            Err(err) => {
                // unknown is treated as alive; the next poll asks again
                warn!("Could not query server process status: {}", err);
                true
            }
        }
    }

    async fn kill_tree(&mut self) -> KillReport {
        let mut report = KillReport::default();
        let Some(mut child) = self.child.take() else {
            self.handle = None;
            return report;
        };
        let root = child.id();

        if let Some(root) = root {
            match ProcessHelper::descendants(root) {
                Ok(pids) => {
                    for pid in pids {
                        match ProcessHelper::kill(pid) {
                            Ok(()) => report.killed.push(pid),
                            Err(err) => {
                                warn!("Could not kill child process (pid={}): {}", pid, err);
                                report.failed.push((pid, err.to_string()));
                            }
                        }
                    }
                }
                Err(err) => warn!("Could not list children of pid={}: {}", root, err),
            }
        }

        let pid = root.unwrap_or(0);
        let outcome = match child.start_kill() {
            Ok(()) => Self::reap_within(&mut child, REAP_TIMEOUT).await,
            Err(err) => Err(err.to_string()),
        };
        match outcome {
            Ok(status) => {
                debug!("pid={} ended with {}", pid, status);
                report.killed.push(pid);
            }
            Err(reason) => {
                warn!("Could not kill process (pid={}): {}", pid, reason);
                report.failed.push((pid, reason));
            }
        }
        self.handle = None;
        report
    }

    fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }
}
