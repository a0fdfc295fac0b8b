//! File tree watcher that triggers worker reloads.

use std::path::PathBuf;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::ignore::IgnoreRules;
use crate::config::ReloadConfig;
use crate::error::ServeError;
use crate::lifecycle::{LifecycleEvent, ReloadCause, Shutdown};

/// Watches the application tree and emits debounced reload events.
pub struct ChangeWatcher {
    roots: Vec<PathBuf>,
    rules: IgnoreRules,
    debounce: Duration,
    events: mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChangeWatcher {
    pub fn new(config: &ReloadConfig, events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self {
            roots: config.watch_paths.clone(),
            rules: IgnoreRules::new(&config.ignore),
            debounce: Duration::from_millis(config.debounce_ms),
            events,
        }
    }

    /// Start watching. The returned watcher must be kept alive; the debounce
    /// task is tracked by `shutdown` and stops when it completes.
    pub fn run(self, shutdown: &mut Shutdown) -> Result<RecommendedWatcher, ServeError> {
        let mut stop = shutdown.signal();
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let rules = self.rules;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()) {
                        return;
                    }
                    for path in event.paths {
                        if !rules.is_ignored(&path) {
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default(),
        )?;

        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
        tracing::info!(roots = ?self.roots, debounce = ?self.debounce, "Change watcher started");

        let debounce = self.debounce;
        let events = self.events;
        shutdown.track(tokio::spawn(async move {
            loop {
                let mut changed = tokio::select! {
                    Some(path) = raw_rx.recv() => path,
                    _ = stop.fired() => break,
                    else => break,
                };

                // Let a burst (editor save, checkout) settle into one reload.
                let mut count = 1usize;
                while let Ok(Some(path)) = tokio::time::timeout(debounce, raw_rx.recv()).await {
                    changed = path;
                    count += 1;
                }

                tracing::info!(path = %changed.display(), changes = count, "Change detected");
                if events
                    .send(LifecycleEvent::Reload(ReloadCause::FileChange(changed)))
                    .is_err()
                {
                    break;
                }
            }
            tracing::debug!("Change watcher stopped");
        }));

        Ok(watcher)
    }
}
