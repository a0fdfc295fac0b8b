//! Worker records kept by the pool.

use std::fmt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::net::BindingInfo;

/// Pool-unique worker identifier; never reused within a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of one worker.
///
/// ```text
/// Starting ──ready──▶ Running ──drain──▶ Stopping ──exit──▶ Dead
///                        └───────────crash──────────────────▶ Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Dead,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
    /// The worker could not be waited on, or its task failed.
    Failed(String),
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signal)) => WorkerExit::Signal(signal),
            (None, None) => WorkerExit::Failed(status.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerExit::Code(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {code}"),
            WorkerExit::Signal(signal) => write!(f, "killed by signal {signal}"),
            WorkerExit::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Handle the pool uses to stop a worker, whatever runs it.
pub trait WorkerControl: Send {
    /// OS process id, for process-backed workers.
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to stop accepting and finish in-flight requests.
    fn drain(&mut self, grace: Duration);

    /// Stop the worker immediately.
    fn kill(&mut self);
}

pub struct Worker {
    pub id: WorkerId,
    pub generation: u64,
    pub status: WorkerStatus,
    pub bindings: Vec<BindingInfo>,
    pub started_at: Instant,
    control: Box<dyn WorkerControl>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("pid", &self.pid())
            .finish()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        generation: u64,
        bindings: Vec<BindingInfo>,
        control: Box<dyn WorkerControl>,
    ) -> Self {
        Self {
            id,
            generation,
            status: WorkerStatus::Starting,
            bindings,
            started_at: Instant::now(),
            control,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn drain(&mut self, grace: Duration) {
        self.status = WorkerStatus::Stopping;
        self.control.drain(grace);
    }

    pub fn kill(&mut self) {
        self.status = WorkerStatus::Stopping;
        self.control.kill();
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            generation: self.generation,
            status: self.status,
            pid: self.pid(),
            bindings: self.bindings.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Read-only copy of a worker record.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub generation: u64,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub bindings: Vec<BindingInfo>,
    pub uptime_secs: u64,
}
