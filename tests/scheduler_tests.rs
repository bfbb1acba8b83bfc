use flagsync::core::{DataJob, LifecycleAwareTaskManager, TaskScope};
use flagsync::{DataStrategy, LifecycleEvent, NetworkEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A job that counts its runs and how many of them overlap.
struct JobTracker {
    runs: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl JobTracker {
    fn new() -> Self {
        Self {
            runs: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn job(&self, id: &str, strategy: DataStrategy) -> DataJob {
        let runs = Arc::clone(&self.runs);
        let running = Arc::clone(&self.running);
        let max_running = Arc::clone(&self.max_running);
        DataJob::new(id, strategy, move || {
            let runs = Arc::clone(&runs);
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            async move {
                let _guard = RunningGuard::enter(running, &max_running);
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

/// Keeps `running` accurate even when a run is cancelled mid-way.
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn enter(running: Arc<AtomicUsize>, max_running: &AtomicUsize) -> Self {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        max_running.fetch_max(now, Ordering::SeqCst);
        Self(running)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn strategy(interval_ms: u64, pause_on_background: bool) -> DataStrategy {
    DataStrategy::new(Duration::from_millis(interval_ms)).pause_on_background(pause_on_background)
}

#[tokio::test]
async fn test_background_pause_respects_strategy() {
    let pausing = JobTracker::new();
    let persistent = JobTracker::new();
    let manager = LifecycleAwareTaskManager::new(
        vec![
            pausing.job("pausing", strategy(1000, true)),
            persistent.job("persistent", strategy(1000, false)),
        ],
        TaskScope::new(),
    );

    manager.start().await;
    assert_eq!(
        manager.active_jobs().await,
        vec!["pausing".to_string(), "persistent".to_string()]
    );

    manager
        .handle_lifecycle_event(LifecycleEvent::EnterBackground)
        .await;
    assert_eq!(manager.active_jobs().await, vec!["persistent".to_string()]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let persistent_runs = persistent.runs();
    manager
        .handle_lifecycle_event(LifecycleEvent::EnterForeground)
        .await;
    assert_eq!(
        manager.active_jobs().await,
        vec!["pausing".to_string(), "persistent".to_string()]
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    // The persistent job was left alone, so no extra immediate run.
    assert_eq!(persistent.runs(), persistent_runs);
    assert_eq!(pausing.runs(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_start_twice_does_not_duplicate() {
    let tracker = JobTracker::new();
    let manager =
        LifecycleAwareTaskManager::new(vec![tracker.job("poll", strategy(10, true))], TaskScope::new());

    manager.start().await;
    manager.start().await;
    manager
        .handle_lifecycle_event(LifecycleEvent::EnterForeground)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.stop().await;

    assert_eq!(tracker.max_running.load(Ordering::SeqCst), 1);
    assert!(tracker.runs() >= 3);
}

#[tokio::test]
async fn test_pause_waits_for_job_to_stop() {
    let tracker = JobTracker::new();
    let manager =
        LifecycleAwareTaskManager::new(vec![tracker.job("poll", strategy(10, true))], TaskScope::new());

    manager.start().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    manager
        .handle_lifecycle_event(LifecycleEvent::EnterBackground)
        .await;

    let runs = tracker.runs();
    assert_eq!(tracker.running.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tracker.runs(), runs);
}

#[tokio::test]
async fn test_network_gates_all_jobs() {
    let tracker = JobTracker::new();
    let manager = LifecycleAwareTaskManager::new(
        vec![tracker.job("persistent", strategy(1000, false))],
        TaskScope::new(),
    );

    manager.handle_network_event(NetworkEvent::Lost).await;
    manager.start().await;
    assert!(manager.active_jobs().await.is_empty());
    assert!(manager.is_foreground());

    manager.handle_network_event(NetworkEvent::Available).await;
    assert_eq!(manager.active_jobs().await, vec!["persistent".to_string()]);
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_is_terminal() {
    let tracker = JobTracker::new();
    let manager =
        LifecycleAwareTaskManager::new(vec![tracker.job("poll", strategy(10, false))], TaskScope::new());

    manager.start().await;
    manager.stop().await;
    manager.start().await;
    manager
        .handle_lifecycle_event(LifecycleEvent::EnterForeground)
        .await;
    manager.handle_network_event(NetworkEvent::Available).await;

    assert!(manager.is_stopped());
    assert!(manager.active_jobs().await.is_empty());
}

#[tokio::test]
async fn test_cancelling_scope_stops_jobs() {
    let tracker = JobTracker::new();
    let scope = TaskScope::new();
    let manager =
        LifecycleAwareTaskManager::new(vec![tracker.job("poll", strategy(10, true))], scope.child());

    manager.start().await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    scope.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let runs = tracker.runs();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tracker.runs(), runs);
    assert!(manager.active_jobs().await.is_empty());
}
