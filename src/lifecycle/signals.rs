//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to lifecycle events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces an immediate exit
//! - SIGHUP triggers a worker reload, not shutdown

use std::fmt;
use std::path::PathBuf;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Why a reload was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadCause {
    /// SIGHUP.
    Signal,
    /// The change watcher saw this path change.
    FileChange(PathBuf),
}

impl fmt::Display for ReloadCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReloadCause::Signal => f.write_str("SIGHUP"),
            ReloadCause::FileChange(path) => write!(f, "change in {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Shutdown,
    Reload(ReloadCause),
}

/// Exit status used when a second termination signal interrupts a drain.
const FORCED_EXIT: i32 = 130;

/// Forward process signals into `events`. Must run inside the runtime.
pub fn spawn_signal_listener(
    events: mpsc::UnboundedSender<LifecycleEvent>,
) -> std::io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let mut stopping = false;
        loop {
            let name = tokio::select! {
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP received, reloading workers");
                    let _ = events.send(LifecycleEvent::Reload(ReloadCause::Signal));
                    continue;
                }
            };

            if stopping {
                tracing::warn!(signal = name, "Second termination signal, exiting now");
                std::process::exit(FORCED_EXIT);
            }
            stopping = true;
            tracing::info!(signal = name, "Shutdown signal received");
            let _ = events.send(LifecycleEvent::Shutdown);
        }
    }))
}
