//! Stop signal for the supervisor's helper tasks.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Level-triggered stop flag plus the helper tasks (change watcher debounce
/// loop) that must observe it before the supervisor exits.
pub struct Shutdown {
    tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Receiving side handed to a helper task.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Vec::new(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait for `task` in `complete`.
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Fire the signal, then give tracked tasks `grace` to finish; stragglers
    /// are aborted.
    pub async fn complete(self, grace: Duration) {
        self.tx.send_replace(true);
        for mut task in self.tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("Helper task ignored shutdown; aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown has been requested, including before the call,
    /// or when the `Shutdown` is gone.
    pub async fn fired(&mut self) {
        let _ = self.rx.wait_for(|stopping| *stopping).await;
    }
}
