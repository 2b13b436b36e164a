use crate::registry::{Backend, BackendRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// State of a backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// No process handle exists
    Stopped,
    /// A process was spawned and has not been observed to exit
    Running,
}

/// Errors returned by [`Supervisor::start`]
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("failed to spawn '{command}' for backend '{id}': {source}")]
    Spawn {
        id: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a successful [`Supervisor::start`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned
    Started { pid: u32 },
    /// A handle already existed; nothing was spawned
    AlreadyRunning { pid: u32 },
}

/// A live handle owned by the supervisor
struct ManagedProcess {
    pid: u32,
    /// Distinguishes this spawn from earlier ones for the same id
    generation: u64,
    started_at: DateTime<Utc>,
    /// Tells the exit observer to reap the child after a forced stop
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Snapshot of a running backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Owns at most one OS process per backend id.
///
/// # Usage
///
/// `Supervisor` is designed to be used behind an `Arc`; [`new`](Supervisor::new)
/// returns `Arc<Self>` directly. `start` needs `&Arc<Self>` because it spawns an
/// exit observer task that refers back to the supervisor.
///
/// # Serialization
///
/// The handle table lives behind a single mutex. The existence check, the
/// spawn and the insert happen in one critical section, as do the removal and
/// the kill in `stop`, so concurrent `start`/`stop` calls for the same id can
/// never leave two live processes or an orphaned handle behind.
///
/// Exit observers only clear the handle they were created for (matched by
/// generation), so a late exit of a stopped process never clears its
/// replacement.
pub struct Supervisor {
    registry: Arc<BackendRegistry>,
    processes: Mutex<HashMap<String, ManagedProcess>>,
    next_generation: AtomicU64,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(registry: Arc<BackendRegistry>, restart_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            processes: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            restart_delay,
        })
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    /// Get the current state of a backend
    pub fn state(&self, id: &str) -> BackendState {
        if self.processes.lock().contains_key(id) {
            BackendState::Running
        } else {
            BackendState::Stopped
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state(id) == BackendState::Running
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.lock().get(id).map(|p| p.pid)
    }

    pub fn started_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.processes.lock().get(id).map(|p| p.started_at)
    }

    pub fn info(&self, id: &str) -> Option<ProcessInfo> {
        self.processes.lock().get(id).map(|p| ProcessInfo {
            pid: p.pid,
            started_at: p.started_at,
        })
    }

    /// Ids with a live handle
    pub fn running(&self) -> Vec<String> {
        self.processes.lock().keys().cloned().collect()
    }

    /// Start a backend unless it already has a handle
    pub fn start(self: &Arc<Self>, id: &str) -> Result<StartOutcome, SupervisorError> {
        let backend = self
            .registry
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownBackend(id.to_string()))?;

        let mut processes = self.processes.lock();
        if let Some(existing) = processes.get(id) {
            debug!(id, pid = existing.pid, "Backend already running");
            return Ok(StartOutcome::AlreadyRunning { pid: existing.pid });
        }

        let program = backend.program();
        info!(
            id,
            program = %program.display(),
            working_dir = %backend.working_dir.display(),
            "Starting backend"
        );

        let child = spawn_backend(backend, &program).map_err(|source| SupervisorError::Spawn {
            id: id.to_string(),
            command: program.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();

        processes.insert(
            id.to_string(),
            ManagedProcess {
                pid,
                generation,
                started_at: Utc::now(),
                kill_tx: Some(kill_tx),
            },
        );
        drop(processes);

        info!(id, pid, generation, "Backend process spawned");

        let supervisor = Arc::downgrade(self);
        let id_owned = id.to_string();
        tokio::spawn(async move {
            observe_exit(supervisor, id_owned, generation, child, kill_rx).await;
        });

        Ok(StartOutcome::Started { pid })
    }

    /// Force-stop a backend and its descendants
    ///
    /// Returns false when there was nothing to stop. The handle is cleared
    /// immediately, without waiting for the exit observer.
    pub fn stop(&self, id: &str) -> bool {
        let mut processes = self.processes.lock();
        let Some(mut process) = processes.remove(id) else {
            debug!(id, "Backend not running, nothing to stop");
            return false;
        };

        info!(id, pid = process.pid, "Killing backend process tree");

        if process.pid > 0 {
            if let Err(e) = kill_process_tree(process.pid) {
                warn!(id, pid = process.pid, error = %e, "Failed to kill backend process tree");
            }
        }

        if let Some(kill_tx) = process.kill_tx.take() {
            let _ = kill_tx.send(());
        }

        true
    }

    /// Stop, wait for the restart delay, then start again
    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<StartOutcome, SupervisorError> {
        self.stop(id);
        tokio::time::sleep(self.restart_delay).await;
        self.start(id)
    }

    /// Start a backend after the restart delay, in the background
    pub fn start_after_delay(self: &Arc<Self>, id: &str) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.restart_delay).await;
            if let Err(e) = supervisor.start(&id) {
                error!(id = %id, error = %e, "Failed to start backend after delay");
            }
        })
    }

    /// Stop all backends
    pub fn stop_all(&self) {
        let ids = self.running();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Drop the handle for `id` if it still belongs to `generation`
    fn clear_generation(&self, id: &str, generation: u64) -> bool {
        let mut processes = self.processes.lock();
        match processes.get(id) {
            Some(p) if p.generation == generation => {
                processes.remove(id);
                true
            }
            _ => false,
        }
    }
}

fn spawn_backend(backend: &Backend, program: &Path) -> std::io::Result<Child> {
    let mut cmd = std::process::Command::new(program);
    cmd.args(&backend.args);
    cmd.current_dir(&backend.working_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());

    // Own process group so the whole tree can be killed at once
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    Command::from(cmd).spawn()
}

/// Wait for the child to exit, or for a forced stop
async fn observe_exit(
    supervisor: Weak<Supervisor>,
    id: String,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    match exited {
        Some(Ok(status)) => {
            let cleared = supervisor
                .upgrade()
                .map(|s| s.clear_generation(&id, generation))
                .unwrap_or(false);
            if cleared {
                warn!(id = %id, code = ?status.code(), "Backend process exited");
            } else {
                debug!(id = %id, code = ?status.code(), "Stopped backend process exited");
            }
        }
        Some(Err(e)) => {
            if let Some(s) = supervisor.upgrade() {
                s.clear_generation(&id, generation);
            }
            error!(id = %id, error = %e, "Error waiting for backend process");
        }
        None => {
            // Tree was already signalled; make sure the leader is reaped
            if let Err(e) = child.kill().await {
                debug!(id = %id, error = %e, "Backend process already gone");
            }
            debug!(id = %id, generation, "Backend process reaped after stop");
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    // Negative pid targets the process group the backend leads
    let result = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) -> std::io::Result<()> {
    std::process::Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/f", "/t"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) -> std::io::Result<()> {
    // The exit observer kills the child directly
    Ok(())
}
