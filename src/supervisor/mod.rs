//! Worker pool supervision.
//!
//! # Data Flow
//! ```text
//! WorkerPool
//!     → Launcher::launch (process re-exec, or in-process task)
//!     → worker adopts listeners, starts serving, announces ready
//!     → WorkerEvent stream (ready / exited / drain deadline)
//!     → pool state machine, crash reporting, reload sequencing
//! ```
//!
//! # Design Decisions
//! - The supervisor owns the listener descriptors for its whole life, so a
//!   replacement generation can start accepting before the old one stops
//! - Crashed workers are reported, not restarted
//! - Process workers talk back over stdout; control flows down as signals

pub mod control;
pub mod launcher;
pub mod pool;
pub mod worker;

pub use control::{worker_id_from_env, ControlMessage, WORKER_ID_ENV};
pub use launcher::{EventSender, Launcher, ProcessLauncher, TaskLauncher, WorkerEvent};
pub use pool::{PoolSettings, WorkerPool};
pub use worker::{Worker, WorkerControl, WorkerExit, WorkerId, WorkerSnapshot, WorkerStatus};
