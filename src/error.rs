//! Error taxonomy of the serving core.
//!
//! | Variant          | Fatal | Exit code |
//! |------------------|-------|-----------|
//! | `Config`         | yes   | 2         |
//! | `Bind`           | yes   | 3         |
//! | `WorkerCrash`    | no    | -         |
//! | `ReloadFailure`  | no    | -         |
//! | everything else  | yes   | 1         |

use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;
use crate::net::Protocol;
use crate::supervisor::{WorkerExit, WorkerId};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {protocol} listener on port {port}: {source}")]
    Bind {
        protocol: Protocol,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("{id} crashed ({exit})")]
    WorkerCrash { id: WorkerId, exit: WorkerExit },

    #[error("reload aborted, keeping current workers: {0}")]
    ReloadFailure(String),

    #[error("workers failed to start: {0}")]
    WorkerStartup(String),

    #[error("every worker has exited; nothing is serving")]
    PoolExhausted,

    #[error("failed to daemonize: {0}")]
    Daemonize(#[source] std::io::Error),

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServeError {
    /// Whether the error must stop the process tree.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ServeError::WorkerCrash { .. } | ServeError::ReloadFailure(_)
        )
    }

    /// Numeric process exit status for this error.
    pub fn exit_status(&self) -> u8 {
        match self {
            ServeError::Config(_) => 2,
            ServeError::Bind { .. } => 3,
            _ => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}
