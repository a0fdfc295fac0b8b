//! Worker pool: start, reload (new before old), crash accounting, shutdown.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use super::launcher::{EventSender, Launcher, WorkerEvent};
use super::worker::{Worker, WorkerId, WorkerSnapshot, WorkerStatus};
use crate::config::ServingConfig;
use crate::error::ServeError;
use crate::observability::metrics;

/// Extra time past the drain grace before a worker is killed.
const KILL_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Workers per generation; at least one.
    pub size: usize,
    pub startup_timeout: Duration,
    pub drain_grace: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &ServingConfig) -> Self {
        Self {
            size: config.worker_count.max(1),
            startup_timeout: config.pool.startup_timeout(),
            drain_grace: config.pool.drain_grace(),
        }
    }
}

pub struct WorkerPool<L: Launcher> {
    launcher: L,
    settings: PoolSettings,
    workers: BTreeMap<WorkerId, Worker>,
    next_id: u64,
    generation: u64,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl<L: Launcher> WorkerPool<L> {
    pub fn new(launcher: L, settings: PoolSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            launcher,
            settings,
            workers: BTreeMap::new(),
            next_id: 1,
            generation: 0,
            events_tx,
            events_rx,
        }
    }

    /// Start the first generation; returns once every worker is running.
    pub async fn start(&mut self) -> Result<(), ServeError> {
        let ids = self.spawn_generation()?;
        if let Err(reason) = self.await_ready(&ids).await {
            self.kill_all(&ids);
            return Err(ServeError::WorkerStartup(reason));
        }
        tracing::info!(
            workers = ids.len(),
            generation = self.generation,
            "Worker pool ready"
        );
        Ok(())
    }

    /// Replace every worker: start a full new generation, wait for it to be
    /// running, then drain the old one. On failure the new workers are
    /// killed and the old ones keep serving.
    pub async fn reload(&mut self) -> Result<(), ServeError> {
        let old: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Running))
            .map(|w| w.id)
            .collect();

        let new = match self.spawn_generation() {
            Ok(ids) => ids,
            Err(e) => {
                metrics::record_reload("failed");
                return Err(ServeError::ReloadFailure(e.to_string()));
            }
        };
        if let Err(reason) = self.await_ready(&new).await {
            self.kill_all(&new);
            metrics::record_reload("failed");
            return Err(ServeError::ReloadFailure(reason));
        }

        for id in &old {
            self.drain_worker(*id);
        }
        metrics::record_reload("ok");
        tracing::info!(
            generation = self.generation,
            replaced = old.len(),
            "Reload complete"
        );
        Ok(())
    }

    /// Drain every worker and wait for all of them to exit.
    pub async fn shutdown(&mut self) {
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.drain_worker(id);
        }

        let deadline = Instant::now() + self.settings.drain_grace + KILL_MARGIN;
        while !self.workers.is_empty() {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(remaining = self.workers.len(), "Workers outlived shutdown grace, killing");
                    let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
                    self.kill_all(&ids);
                    self.reap(KILL_MARGIN).await;
                    break;
                }
            }
        }
        metrics::set_workers_running(0);
    }

    /// Next event from any worker.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events_rx.recv().await
    }

    /// Apply an event; returns the crash it reports, if any.
    pub fn handle_event(&mut self, event: WorkerEvent) -> Option<ServeError> {
        match event {
            WorkerEvent::Ready(id) => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    if worker.status == WorkerStatus::Starting {
                        worker.status = WorkerStatus::Running;
                        tracing::info!(
                            worker = %id,
                            pid = ?worker.pid(),
                            generation = worker.generation,
                            "Worker running"
                        );
                    }
                }
                self.publish_running();
                None
            }
            WorkerEvent::Exited(id, exit) => {
                let worker = self.workers.remove(&id)?;
                self.publish_running();
                if worker.status == WorkerStatus::Stopping {
                    tracing::info!(worker = %id, exit = %exit, "Worker stopped");
                    return None;
                }
                metrics::record_worker_crash();
                tracing::error!(
                    worker = %id,
                    pid = ?worker.pid(),
                    exit = %exit,
                    remaining = self.running_count(),
                    "Worker crashed; not restarting"
                );
                Some(ServeError::WorkerCrash { id, exit })
            }
            WorkerEvent::DrainDeadline(id) => {
                if let Some(worker) = self.workers.get_mut(&id) {
                    if worker.status == WorkerStatus::Stopping {
                        tracing::warn!(worker = %id, "Drain grace expired, killing worker");
                        worker.kill();
                    }
                }
                None
            }
        }
    }

    /// Workers currently serving.
    pub fn running_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Running)
            .count()
    }

    /// Workers that are serving or about to.
    pub fn live_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Running))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(Worker::snapshot).collect()
    }

    fn spawn_generation(&mut self) -> Result<Vec<WorkerId>, ServeError> {
        self.generation += 1;
        let bindings = self.launcher.bindings();
        let mut ids = Vec::with_capacity(self.settings.size);

        for _ in 0..self.settings.size {
            let id = WorkerId::new(self.next_id);
            self.next_id += 1;
            match self.launcher.launch(id, self.events_tx.clone()) {
                Ok(control) => {
                    let worker = Worker::new(id, self.generation, bindings.clone(), control);
                    tracing::debug!(worker = %id, pid = ?worker.pid(), generation = self.generation, "Worker starting");
                    self.workers.insert(id, worker);
                    ids.push(id);
                }
                Err(e) => {
                    self.kill_all(&ids);
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    async fn await_ready(&mut self, ids: &[WorkerId]) -> Result<(), String> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            let ready = ids
                .iter()
                .filter(|id| {
                    self.workers
                        .get(*id)
                        .is_some_and(|w| w.status == WorkerStatus::Running)
                })
                .count();
            if ready == ids.len() {
                return Ok(());
            }

            let event = match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err("worker event channel closed".to_string()),
                Err(_) => {
                    return Err(format!(
                        "{ready} of {} workers ready after {:?}",
                        ids.len(),
                        self.settings.startup_timeout
                    ))
                }
            };

            if let WorkerEvent::Exited(id, exit) = &event {
                if ids.contains(id) {
                    let reason = format!("{id} exited during startup ({exit})");
                    self.workers.remove(id);
                    self.publish_running();
                    return Err(reason);
                }
            }
            self.handle_event(event);
        }
    }

    fn drain_worker(&mut self, id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&id) else {
            return;
        };
        if worker.status == WorkerStatus::Stopping {
            return;
        }
        tracing::info!(worker = %id, pid = ?worker.pid(), "Draining worker");
        worker.drain(self.settings.drain_grace);
        self.publish_running();

        let events = self.events_tx.clone();
        let wait = self.settings.drain_grace + KILL_MARGIN;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let _ = events.send(WorkerEvent::DrainDeadline(id));
        });
    }

    fn kill_all(&mut self, ids: &[WorkerId]) {
        for id in ids {
            if let Some(worker) = self.workers.get_mut(id) {
                worker.kill();
            }
        }
        self.publish_running();
    }

    /// Collect exits for a short while after killing.
    async fn reap(&mut self, wait: Duration) {
        let deadline = Instant::now() + wait;
        while !self.workers.is_empty() {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event);
                }
                _ => break,
            }
        }
    }

    fn publish_running(&self) {
        metrics::set_workers_running(self.running_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::BindingInfo;
    use crate::supervisor::{WorkerControl, WorkerExit};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy)]
    enum Behaviour {
        Ready,
        FailLaunch,
        NeverReady,
        ExitDuringStartup,
    }

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeLauncher {
        plan: VecDeque<Behaviour>,
        log: Log,
    }

    impl FakeLauncher {
        fn new(plan: &[Behaviour]) -> (Self, Log) {
            let log = Log::default();
            let launcher = Self {
                plan: plan.iter().copied().collect(),
                log: log.clone(),
            };
            (launcher, log)
        }
    }

    struct FakeControl {
        id: WorkerId,
        events: EventSender,
        log: Log,
    }

    impl WorkerControl for FakeControl {
        fn pid(&self) -> Option<u32> {
            Some(1000 + self.id.get() as u32)
        }

        fn drain(&mut self, _grace: Duration) {
            self.log.lock().unwrap().push(format!("drain {}", self.id.get()));
            let _ = self.events.send(WorkerEvent::Exited(self.id, WorkerExit::Code(0)));
        }

        fn kill(&mut self) {
            self.log.lock().unwrap().push(format!("kill {}", self.id.get()));
            let _ = self.events.send(WorkerEvent::Exited(self.id, WorkerExit::Signal(9)));
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&mut self, id: WorkerId, events: EventSender) -> Result<Box<dyn WorkerControl>, ServeError> {
            let behaviour = self.plan.pop_front().unwrap_or(Behaviour::Ready);
            self.log.lock().unwrap().push(format!("launch {}", id.get()));
            match behaviour {
                Behaviour::FailLaunch => return Err(ServeError::WorkerStartup("spawn failed".into())),
                Behaviour::Ready => {
                    let _ = events.send(WorkerEvent::Ready(id));
                }
                Behaviour::ExitDuringStartup => {
                    let _ = events.send(WorkerEvent::Exited(id, WorkerExit::Code(1)));
                }
                Behaviour::NeverReady => {}
            }
            Ok(Box::new(FakeControl {
                id,
                events,
                log: self.log.clone(),
            }))
        }

        fn bindings(&self) -> Vec<BindingInfo> {
            Vec::new()
        }
    }

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            startup_timeout: Duration::from_millis(100),
            drain_grace: Duration::from_secs(5),
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn zero_workers_means_one_in_process_worker() {
        let config = ServingConfig::default();
        assert_eq!(PoolSettings::from_config(&config).size, 1);
    }

    #[tokio::test]
    async fn start_waits_for_every_worker() {
        let (launcher, _) = FakeLauncher::new(&[]);
        let mut pool = WorkerPool::new(launcher, settings(3));
        pool.start().await.unwrap();
        assert_eq!(pool.running_count(), 3);
        assert_eq!(pool.generation(), 1);
        assert!(pool.snapshot().iter().all(|w| w.status == WorkerStatus::Running));
    }

    #[tokio::test]
    async fn start_fails_when_a_worker_never_reports_ready() {
        let (launcher, log) = FakeLauncher::new(&[Behaviour::Ready, Behaviour::NeverReady]);
        let mut pool = WorkerPool::new(launcher, settings(2));
        let err = pool.start().await.unwrap_err();
        assert!(matches!(err, ServeError::WorkerStartup(ref m) if m.contains("1 of 2")));
        assert!(entries(&log).contains(&"kill 2".to_string()));
    }

    #[tokio::test]
    async fn start_fails_when_launch_fails() {
        let (launcher, log) = FakeLauncher::new(&[Behaviour::Ready, Behaviour::FailLaunch]);
        let mut pool = WorkerPool::new(launcher, settings(2));
        assert!(pool.start().await.is_err());
        assert!(entries(&log).contains(&"kill 1".to_string()));
    }

    #[tokio::test]
    async fn reload_starts_new_generation_before_draining_old() {
        let (launcher, log) = FakeLauncher::new(&[]);
        let mut pool = WorkerPool::new(launcher, settings(2));
        pool.start().await.unwrap();
        pool.reload().await.unwrap();

        let log = entries(&log);
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(position("launch 4") < position("drain 1"));
        assert!(position("launch 4") < position("drain 2"));

        // Old workers exit once drained.
        while pool.snapshot().len() > 2 {
            let event = pool.next_event().await.unwrap();
            assert!(pool.handle_event(event).is_none());
        }
        assert_eq!(pool.running_count(), 2);
        assert!(pool.snapshot().iter().all(|w| w.generation == 2));
    }

    #[tokio::test]
    async fn failed_reload_keeps_old_workers() {
        let plan = [Behaviour::Ready, Behaviour::Ready, Behaviour::Ready, Behaviour::NeverReady];
        let (launcher, log) = FakeLauncher::new(&plan);
        let mut pool = WorkerPool::new(launcher, settings(2));
        pool.start().await.unwrap();

        let err = pool.reload().await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, ServeError::ReloadFailure(_)));

        let log = entries(&log);
        assert!(log.contains(&"kill 3".to_string()));
        assert!(log.contains(&"kill 4".to_string()));
        assert!(!log.iter().any(|e| e.starts_with("drain")));
        assert_eq!(pool.running_count(), 2);
    }

    #[tokio::test]
    async fn replacement_exiting_during_startup_aborts_reload() {
        let plan = [Behaviour::Ready, Behaviour::ExitDuringStartup];
        let (launcher, _) = FakeLauncher::new(&plan);
        let mut pool = WorkerPool::new(launcher, settings(1));
        pool.start().await.unwrap();

        let err = pool.reload().await.unwrap_err();
        assert!(matches!(err, ServeError::ReloadFailure(ref m) if m.contains("worker-2")));
        assert_eq!(pool.running_count(), 1);
    }

    #[tokio::test]
    async fn crash_is_reported_and_not_restarted() {
        let (launcher, log) = FakeLauncher::new(&[]);
        let mut pool = WorkerPool::new(launcher, settings(2));
        pool.start().await.unwrap();

        pool.events_tx
            .send(WorkerEvent::Exited(WorkerId::new(1), WorkerExit::Code(3)))
            .unwrap();
        let event = pool.next_event().await.unwrap();
        let err = pool.handle_event(event).unwrap();
        assert!(matches!(err, ServeError::WorkerCrash { .. }));
        assert!(!err.is_fatal());
        assert_eq!(pool.running_count(), 1);
        assert_eq!(entries(&log).iter().filter(|e| e.starts_with("launch")).count(), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_everyone() {
        let (launcher, log) = FakeLauncher::new(&[]);
        let mut pool = WorkerPool::new(launcher, settings(2));
        pool.start().await.unwrap();
        pool.shutdown().await;
        assert!(pool.is_empty());
        let log = entries(&log);
        assert!(log.contains(&"drain 1".to_string()));
        assert!(log.contains(&"drain 2".to_string()));
    }
}
