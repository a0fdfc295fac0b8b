//! Worker backends.
//!
//! - `ProcessLauncher`: re-executes the current binary with `--fd` and the
//!   resolved config in `HX_WORKER_CONFIG`; the child adopts the
//!   supervisor's listeners
//! - `TaskLauncher`: runs the server as a task of this process on duplicated
//!   descriptors (`worker_count == 0`)

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use super::control::{ControlMessage, WORKER_ID_ENV};
use super::worker::{WorkerControl, WorkerExit, WorkerId};
use crate::cache;
use crate::config::{ServingConfig, WORKER_CONFIG_ENV};
use crate::error::ServeError;
use crate::http::{AppFactory, ServerControl, WorkerServer};
use crate::net::{BindingInfo, ListenerSet};

/// Something that happened to a worker, delivered to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Ready(WorkerId),
    Exited(WorkerId, WorkerExit),
    /// A draining worker used up its grace period.
    DrainDeadline(WorkerId),
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Starts workers for the pool.
pub trait Launcher: Send {
    /// Start one worker. Readiness and exit are reported through `events`.
    fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerControl>, ServeError>;

    /// Listeners every worker serves.
    fn bindings(&self) -> Vec<BindingInfo>;
}

/// Re-executes the current binary as a worker process.
pub struct ProcessLauncher {
    listeners: ListenerSet,
    program: PathBuf,
    args: Vec<OsString>,
    /// Resolved configuration as JSON; workers never re-read argv or files.
    handoff: String,
}

impl ProcessLauncher {
    /// Owns the served listeners; their descriptors stay open here across
    /// reloads so every generation adopts the same sockets. `config` must
    /// already be pinned to the bound ports.
    pub fn new(config: &ServingConfig, listeners: ListenerSet) -> Result<Self, ServeError> {
        Ok(Self {
            listeners,
            program: std::env::current_exe()?,
            args: Vec::new(),
            handoff: serde_json::to_string(config).map_err(std::io::Error::other)?,
        })
    }

    #[cfg(test)]
    fn with_program(
        config: &ServingConfig,
        listeners: ListenerSet,
        program: PathBuf,
        args: Vec<OsString>,
    ) -> Self {
        Self {
            listeners,
            program,
            args,
            handoff: serde_json::to_string(config).unwrap(),
        }
    }

    fn command(&self, id: WorkerId) -> Command {
        let fds = self.listeners.fd_map();
        let descriptors = fds.descriptors();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--fd")
            .arg(fds.to_string())
            .env(WORKER_ID_ENV, id.get().to_string())
            .env(WORKER_CONFIG_ENV, &self.handoff)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // Terminal signals go to the supervisor alone; it drains workers.
            .process_group(0)
            .kill_on_drop(true);

        // Runs in the forked child only: the supervisor's copies keep
        // close-on-exec.
        unsafe {
            command.pre_exec(move || inherit_descriptors(&descriptors));
        }
        command
    }
}

fn inherit_descriptors(descriptors: &[RawFd]) -> std::io::Result<()> {
    for &fd in descriptors {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    #[cfg(target_os = "linux")]
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerControl>, ServeError> {
        let mut child = self
            .command(id)
            .spawn()
            .map_err(|e| ServeError::WorkerStartup(format!("{id}: {e}")))?;
        let pid = child.id();
        tracing::debug!(worker = %id, pid, "Worker process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_control_channel(id, stdout, events.clone()));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(worker = %id, error = %e, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => WorkerExit::Failed(e.to_string()),
            };
            let _ = events.send(WorkerEvent::Exited(id, exit));
        });

        Ok(Box::new(ProcessControl {
            pid,
            kill: Some(kill_tx),
        }))
    }

    fn bindings(&self) -> Vec<BindingInfo> {
        self.listeners.infos()
    }
}

async fn read_control_channel(id: WorkerId, stdout: ChildStdout, events: EventSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match ControlMessage::parse(&line) {
                Some(ControlMessage::Ready { pid, addresses }) => {
                    tracing::debug!(worker = %id, pid, ?addresses, "Worker announced ready");
                    let _ = events.send(WorkerEvent::Ready(id));
                }
                Some(ControlMessage::Draining { pid }) => {
                    tracing::debug!(worker = %id, pid, "Worker draining");
                }
                None => tracing::debug!(worker = %id, line = %line, "Ignoring worker stdout"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(worker = %id, error = %e, "Worker control channel closed");
                break;
            }
        }
    }
}

struct ProcessControl {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerControl for ProcessControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn drain(&mut self, _grace: Duration) {
        // The worker applies its own configured grace; the pool enforces it.
        if let Some(pid) = self.pid {
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == -1 {
                tracing::debug!(
                    pid,
                    error = %std::io::Error::last_os_error(),
                    "SIGTERM not delivered"
                );
            }
        }
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Serves from this process on duplicated listener descriptors.
pub struct TaskLauncher {
    config: Arc<ServingConfig>,
    listeners: ListenerSet,
    app: AppFactory,
}

impl TaskLauncher {
    pub fn new(config: Arc<ServingConfig>, listeners: ListenerSet, app: AppFactory) -> Self {
        Self {
            config,
            listeners,
            app,
        }
    }
}

impl Launcher for TaskLauncher {
    fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerControl>, ServeError> {
        let listeners = self.listeners.try_clone_served()?;
        // A fresh local cache per worker, as a new process would have.
        let cache = cache::handle_for(&self.config);
        let server = WorkerServer::new(&self.config, (self.app)(), cache, listeners).start()?;
        let control = server.control();

        tokio::spawn(async move {
            match server.ready().await {
                Ok(addresses) => {
                    tracing::debug!(worker = %id, ?addresses, "In-process worker ready");
                    let _ = events.send(WorkerEvent::Ready(id));
                }
                Err(e) => tracing::warn!(worker = %id, error = %e, "In-process worker failed to start"),
            }
            let exit = match server.wait().await {
                Ok(()) => WorkerExit::Code(0),
                Err(e) => WorkerExit::Failed(e.to_string()),
            };
            let _ = events.send(WorkerEvent::Exited(id, exit));
        });

        Ok(Box::new(TaskControl { control }))
    }

    fn bindings(&self) -> Vec<BindingInfo> {
        self.listeners.infos()
    }
}

struct TaskControl {
    control: ServerControl,
}

impl WorkerControl for TaskControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn drain(&mut self, grace: Duration) {
        self.control.drain(grace);
    }

    fn kill(&mut self) {
        self.control.stop();
    }
}
