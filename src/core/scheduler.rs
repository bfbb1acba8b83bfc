//! Lifecycle-aware scheduling of periodic data jobs.
//!
//! A job runs while the scheduler is alive, the network is available and
//! either the app is in the foreground or the job's strategy keeps it
//! running in the background.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::DataStrategy;
use super::scope::TaskScope;

/// One run of a job.
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Platform lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    EnterForeground,
    EnterBackground,
    Destroy,
}

/// Connectivity transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
}

/// A named periodic action driven by its `DataStrategy`.
#[derive(Clone)]
pub struct DataJob {
    pub id: String,
    pub strategy: DataStrategy,
    pub action: JobAction,
}

impl DataJob {
    pub fn new<F, Fut>(id: impl Into<String>, strategy: DataStrategy, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: id.into(),
            strategy,
            action: Arc::new(move || Box::pin(action()) as BoxFuture<'static, ()>),
        }
    }
}

impl std::fmt::Debug for DataJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataJob")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RunState {
    foreground: AtomicBool,
    network_available: AtomicBool,
    destroying: AtomicBool,
}

impl RunState {
    fn may_run(&self, strategy: &DataStrategy) -> bool {
        !self.destroying.load(Ordering::SeqCst)
            && self.network_available.load(Ordering::SeqCst)
            && (self.foreground.load(Ordering::SeqCst) || !strategy.pause_on_background)
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.handle.is_finished()
    }
}

/// Runs each job on its own worker and starts or pauses workers as the
/// app moves between foreground and background and the network comes
/// and goes.
///
/// A job runs only while the manager is not stopped and the network is
/// available. Jobs with `pause_on_background` also need the foreground.
pub struct LifecycleAwareTaskManager {
    jobs: Vec<DataJob>,
    state: Arc<RunState>,
    workers: Mutex<HashMap<String, Worker>>,
    scope: TaskScope,
}

impl LifecycleAwareTaskManager {
    /// Starts in the background with the network available; call `start` to
    /// enter the foreground.
    pub fn new(jobs: Vec<DataJob>, scope: TaskScope) -> Self {
        Self {
            jobs,
            state: Arc::new(RunState {
                foreground: AtomicBool::new(false),
                network_available: AtomicBool::new(true),
                destroying: AtomicBool::new(false),
            }),
            workers: Mutex::new(HashMap::new()),
            scope,
        }
    }

    pub fn jobs(&self) -> &[DataJob] {
        &self.jobs
    }

    pub fn is_foreground(&self) -> bool {
        self.state.foreground.load(Ordering::SeqCst)
    }

    pub fn is_network_available(&self) -> bool {
        self.state.network_available.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.destroying.load(Ordering::SeqCst)
    }

    /// Enters the foreground and starts every job allowed to run.
    pub async fn start(&self) {
        self.start_foreground_jobs().await;
    }

    /// Ids of jobs with a live worker, sorted.
    pub async fn active_jobs(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut ids: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| worker.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// `Destroy` stops the manager for good.
    pub async fn handle_lifecycle_event(&self, event: LifecycleEvent) {
        debug!("Lifecycle state changed: {:?}", event);
        match event {
            LifecycleEvent::EnterForeground => self.start_foreground_jobs().await,
            LifecycleEvent::EnterBackground => self.stop_foreground_jobs().await,
            LifecycleEvent::Destroy => self.stop().await,
        }
    }

    /// Pauses every job on `Lost` and resumes eligible ones on `Available`.
    pub async fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Available => {
                debug!("Network available");
                self.state.network_available.store(true, Ordering::SeqCst);
                self.start_eligible_jobs().await;
            }
            NetworkEvent::Lost => {
                debug!("Network connection lost");
                self.state.network_available.store(false, Ordering::SeqCst);
                self.pause_ineligible_jobs().await;
            }
        }
    }

    /// Cancels every job; no later event restarts them.
    pub async fn stop(&self) {
        self.state.destroying.store(true, Ordering::SeqCst);
        self.pause_ineligible_jobs().await;
    }

    async fn start_foreground_jobs(&self) {
        if self.is_stopped() {
            debug!("Scheduler stopped, ignoring start");
            return;
        }
        self.state.foreground.store(true, Ordering::SeqCst);
        if !self.is_network_available() {
            debug!("Network not available, not starting foreground jobs");
            return;
        }
        self.start_eligible_jobs().await;
    }

    async fn stop_foreground_jobs(&self) {
        self.state.foreground.store(false, Ordering::SeqCst);
        self.pause_ineligible_jobs().await;
    }

    async fn start_eligible_jobs(&self) {
        let mut workers = self.workers.lock().await;
        for job in &self.jobs {
            if !self.state.may_run(&job.strategy) {
                continue;
            }
            if workers.get(&job.id).is_some_and(Worker::is_active) {
                continue;
            }
            debug!("Starting job: {}", job.id);
            workers.insert(job.id.clone(), self.spawn_job(job));
        }
    }

    /// Stops the jobs that may no longer run and waits for them to exit.
    async fn pause_ineligible_jobs(&self) {
        let mut workers = self.workers.lock().await;
        let mut stopping = Vec::new();
        for job in &self.jobs {
            if self.state.may_run(&job.strategy) {
                debug!("Keeping job running: {}", job.id);
                continue;
            }
            if let Some(worker) = workers.remove(&job.id) {
                debug!("Pausing job: {}", job.id);
                worker.token.cancel();
                stopping.push(worker.handle);
            }
        }
        for handle in stopping {
            let _ = handle.await;
        }
    }

    fn spawn_job(&self, job: &DataJob) -> Worker {
        let token = self.scope.token().child_token();
        let state = Arc::clone(&self.state);
        let strategy = job.strategy.clone();
        let action = Arc::clone(&job.action);
        let id = job.id.clone();
        let cancelled = token.clone();

        let handle = self.scope.spawn(format!("job {}", job.id), async move {
            if !strategy.delay.is_zero() {
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = tokio::time::sleep(strategy.delay) => {}
                }
            }
            while state.may_run(&strategy) {
                debug!("[{}] Executing action", id);
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = action() => {}
                }
                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = tokio::time::sleep(strategy.interval) => {}
                }
            }
            debug!("[{}] Run conditions no longer hold, exiting", id);
        });

        Worker { token, handle }
    }
}
