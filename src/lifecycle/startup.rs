//! Startup orchestration and role dispatch.
//!
//! # Responsibilities
//! - Bind (or adopt) listeners, daemonize, then build the runtime
//! - Dispatch on role: worker, dev, supervisor
//! - Run the supervisor's event loop: signals, file changes, worker events
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and maps to an exit code
//! - Listeners exist before the process detaches or spawns anything
//! - One `current_thread` runtime per process; workers scale by process

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::Instrument;

use super::daemon;
use super::shutdown::Shutdown;
use super::signals::{spawn_signal_listener, LifecycleEvent};
use crate::cache::{self, CacheServer};
use crate::config::{Role, ServingConfig};
use crate::error::ServeError;
use crate::http::{AppFactory, WorkerServer};
use crate::net::ListenerSet;
use crate::observability::{init_logging, metrics};
use crate::reload::ChangeWatcher;
use crate::supervisor::{
    worker_id_from_env, ControlMessage, Launcher, PoolSettings, ProcessLauncher, TaskLauncher,
    WorkerPool,
};

/// Grace given to the watcher's debounce loop at shutdown.
const HELPER_GRACE: Duration = Duration::from_secs(1);

/// Grace given to in-flight cache round trips at shutdown.
const CACHE_SERVER_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle event queue shared by the signal listener and the watcher.
pub struct LifecycleChannel {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<LifecycleEvent> {
        self.tx.clone()
    }
}

impl Default for LifecycleChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the process to completion and return its exit code.
pub fn launch(config: ServingConfig, app: AppFactory) -> ExitCode {
    let config = Arc::new(config);
    let role = config.role();
    let daemonizing = config.daemonize && role != Role::Worker;

    if !daemonizing {
        init_logging(&config);
    }

    let listeners = match role {
        Role::Worker => match &config.inherited_fds {
            Some(fds) => ListenerSet::adopt(&config, fds),
            None => ListenerSet::bind(&config),
        },
        Role::Dev | Role::Supervisor => ListenerSet::bind(&config),
    };
    let listeners = match listeners {
        Ok(listeners) => listeners,
        Err(e) => return fail(&e, !daemonizing),
    };

    let _pid_file = if daemonizing {
        match daemon::daemonize(&config.daemon) {
            Ok(pid_file) => {
                init_logging(&config);
                tracing::info!(pid = std::process::id(), "Daemonized");
                pid_file
            }
            Err(e) => return fail(&e, false),
        }
    } else {
        None
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return fail(&ServeError::Io(e), true),
    };

    let result = runtime.block_on(async move {
        let channel = LifecycleChannel::new();
        spawn_signal_listener(channel.sender())?;
        serve(config, listeners, app, channel).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e, true),
    }
}

fn fail(error: &ServeError, logging: bool) -> ExitCode {
    if logging {
        tracing::error!(error = %error, "Fatal error");
    } else {
        eprintln!("hx: {error}");
    }
    error.exit_code()
}

/// Serve with already-bound listeners until shutdown.
pub async fn serve(
    config: Arc<ServingConfig>,
    listeners: ListenerSet,
    app: AppFactory,
    channel: LifecycleChannel,
) -> Result<(), ServeError> {
    match config.role() {
        Role::Worker => run_worker(config, listeners, app, channel).await,
        Role::Dev => {
            if config.worker_count > 0 {
                tracing::warn!(
                    workers = config.worker_count,
                    "Dev mode serves from a single process; ignoring worker count"
                );
            }
            run_supervisor(config, listeners, app, channel).await
        }
        Role::Supervisor => run_supervisor(config, listeners, app, channel).await,
    }
}

async fn run_worker(
    config: Arc<ServingConfig>,
    listeners: ListenerSet,
    app: AppFactory,
    mut channel: LifecycleChannel,
) -> Result<(), ServeError> {
    let pid = std::process::id();
    let span = tracing::info_span!(
        "worker",
        id = worker_id_from_env().map(|id| id.get()),
        pid
    );

    async move {
        let server = WorkerServer::new(&config, app(), cache::handle_for(&config), listeners).start()?;
        let addresses = server.ready().await?;
        ControlMessage::Ready {
            pid,
            addresses: addresses.iter().map(ToString::to_string).collect(),
        }
        .announce()
        .await?;
        tracing::info!(?addresses, "Worker serving");

        let control = server.control();
        let mut finished = Box::pin(server.wait());
        loop {
            tokio::select! {
                result = &mut finished => {
                    result?;
                    return Err(ServeError::Io(std::io::Error::other("server stopped without a drain request")));
                }
                event = channel.rx.recv() => match event {
                    Some(LifecycleEvent::Shutdown) | None => {
                        let _ = ControlMessage::Draining { pid }.announce().await;
                        tracing::info!(connections = control.connection_count(), "Draining");
                        control.drain(config.pool.drain_grace());
                        finished.await?;
                        tracing::info!("Worker stopped");
                        return Ok(());
                    }
                    Some(LifecycleEvent::Reload(cause)) => {
                        tracing::debug!(cause = %cause, "Ignoring reload request; the supervisor replaces workers");
                    }
                },
            }
        }
    }
    .instrument(span)
    .await
}

async fn run_supervisor(
    config: Arc<ServingConfig>,
    mut listeners: ListenerSet,
    app: AppFactory,
    mut channel: LifecycleChannel,
) -> Result<(), ServeError> {
    // Port 0 resolves once, here; workers and cache clients use the result.
    let config = Arc::new(listeners.pinned(&config));
    start_metrics(&config);

    let cache_server = match listeners.take_cache() {
        Some(binding) => {
            let server = CacheServer::start(binding, config.cache.max_entries)?;
            server.ready().await;
            Some(server)
        }
        None => None,
    };

    let mut helpers = Shutdown::new();
    let _watcher = if config.reload_enabled {
        Some(ChangeWatcher::new(&config.reload, channel.sender()).run(&mut helpers)?)
    } else {
        None
    };

    let settings = PoolSettings::from_config(&config);
    let result = if config.role() == Role::Supervisor && config.worker_count > 0 {
        let launcher = ProcessLauncher::new(&config, listeners)?;
        supervise(WorkerPool::new(launcher, settings), &mut channel).await
    } else {
        let settings = PoolSettings { size: 1, ..settings };
        let launcher = TaskLauncher::new(config.clone(), listeners, app);
        supervise(WorkerPool::new(launcher, settings), &mut channel).await
    };

    helpers.complete(HELPER_GRACE).await;
    if let Some(server) = cache_server {
        server.shutdown(CACHE_SERVER_GRACE).await;
    }
    tracing::info!("Shutdown complete");
    result
}

/// Supervisor event loop: returns after the pool has been shut down.
async fn supervise<L: Launcher>(
    mut pool: WorkerPool<L>,
    channel: &mut LifecycleChannel,
) -> Result<(), ServeError> {
    pool.start().await?;
    tracing::info!(workers = pool.running_count(), "Serving");

    let result = loop {
        tokio::select! {
            biased;

            event = channel.rx.recv() => match event {
                Some(LifecycleEvent::Reload(cause)) => {
                    // Requests queued while idle collapse into this one.
                    let mut shutdown_requested = false;
                    while let Ok(queued) = channel.rx.try_recv() {
                        if queued == LifecycleEvent::Shutdown {
                            shutdown_requested = true;
                            break;
                        }
                    }
                    if shutdown_requested {
                        break Ok(());
                    }

                    tracing::info!(cause = %cause, "Reloading workers");
                    if let Err(e) = pool.reload().await {
                        tracing::warn!(error = %e, "Reload failed");
                    }
                }
                Some(LifecycleEvent::Shutdown) | None => break Ok(()),
            },

            Some(event) = pool.next_event() => {
                if pool.handle_event(event).is_some() && pool.live_count() == 0 {
                    break Err(ServeError::PoolExhausted);
                }
            }
        }
    };

    tracing::info!("Stopping workers");
    pool.shutdown().await;
    result
}

fn start_metrics(config: &ServingConfig) {
    let Some(address) = config.observability.metrics_address.as_deref() else {
        return;
    };
    match address.parse::<SocketAddr>() {
        Ok(addr) => metrics::init_metrics(addr),
        Err(e) => tracing::error!(metrics_address = %address, error = %e, "Failed to parse metrics address"),
    }
}
