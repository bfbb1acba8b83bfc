use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backup::{BackupStore, Bootstrap, LocalBackup};
use crate::core::{
    ClientConfig, DataJob, Fetcher, LifecycleAwareTaskManager, LifecycleEvent, Listener,
    ListenerRegistry, MetricsCollector, MetricsReporter, MetricsSender, NetworkEvent, NoOpMetrics,
    ObservableCache, TaskScope, ToggleResponse,
};
use crate::error::{ErrorCode, FlagSyncError, Result};
use crate::http::{ReqwestTransport, Transport};
use crate::types::{Context, FlagState, ImpressionEvent, Toggle, Variant};

/// Scheduler id of the polling job.
pub const FETCH_TOGGLES_JOB: &str = "fetchToggles";
/// Scheduler id of the metrics upload job.
pub const SEND_METRICS_JOB: &str = "sendMetrics";

/// Feature flag client.
///
/// Evaluations read the local cache and never wait on the network. A
/// background fetcher keeps the cache in sync with the server for the
/// current context, and a scheduler drives polling and metrics upload
/// according to lifecycle and connectivity signals.
pub struct FlagClient {
    config: ClientConfig,
    context: watch::Sender<Context>,
    cache: Arc<ObservableCache>,
    fetcher: Option<Arc<Fetcher>>,
    metrics: Arc<dyn MetricsCollector>,
    metrics_sender: Option<Arc<MetricsSender>>,
    scheduler: Arc<LifecycleAwareTaskManager>,
    listeners: Arc<ListenerRegistry>,
    backup: Option<Arc<dyn BackupStore>>,
    scope: TaskScope,
    impressions: mpsc::UnboundedSender<ImpressionEvent>,
    impression_rx: Mutex<Option<mpsc::UnboundedReceiver<ImpressionEvent>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl FlagClient {
    /// Validates `config` and builds a client over HTTP. Nothing runs until
    /// `start`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let polling: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.polling_strategy)?);
        let metrics: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&config.metrics_strategy)?);
        Self::build(config, Context::new(), polling, metrics)
    }

    /// Uses `transport` for both polling and metrics.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Self::build(config, Context::new(), Arc::clone(&transport), transport)
    }

    /// Like `with_transport`, starting from `context` instead of an empty one.
    pub fn with_context(
        config: ClientConfig,
        context: Context,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Self::build(config, context, Arc::clone(&transport), transport)
    }

    fn build(
        config: ClientConfig,
        context: Context,
        polling_transport: Arc<dyn Transport>,
        metrics_transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let (context_tx, context_rx) = watch::channel(context);
        let scope = TaskScope::new();

        let fetcher = if config.polling_strategy.enabled {
            Some(Arc::new(Fetcher::new(&config, polling_transport, context_rx)?))
        } else {
            None
        };
        let metrics_sender = if config.metrics_strategy.enabled {
            Some(Arc::new(MetricsSender::new(&config, metrics_transport)?))
        } else {
            None
        };
        let metrics: Arc<dyn MetricsCollector> = match &metrics_sender {
            Some(sender) => Arc::clone(sender) as Arc<dyn MetricsCollector>,
            None => Arc::new(NoOpMetrics),
        };

        let mut jobs = Vec::new();
        if let Some(fetcher) = &fetcher {
            let fetcher = Arc::clone(fetcher);
            jobs.push(DataJob::new(
                FETCH_TOGGLES_JOB,
                config.polling_strategy.clone(),
                move || {
                    let fetcher = Arc::clone(&fetcher);
                    async move {
                        fetcher.refresh_toggles().await;
                    }
                },
            ));
        }
        if let Some(sender) = &metrics_sender {
            let sender = Arc::clone(sender);
            jobs.push(DataJob::new(
                SEND_METRICS_JOB,
                config.metrics_strategy.clone(),
                move || {
                    let sender = Arc::clone(&sender);
                    async move {
                        sender.send_metrics().await;
                    }
                },
            ));
        }
        let scheduler = Arc::new(LifecycleAwareTaskManager::new(jobs, scope.child()));

        let backup: Option<Arc<dyn BackupStore>> = if config.local_storage.enabled {
            match LocalBackup::new(config.local_storage.resolved_dir()) {
                Ok(backup) => Some(Arc::new(backup)),
                Err(e) => {
                    warn!("Local backup disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (impressions, impression_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            context: context_tx,
            cache: Arc::new(ObservableCache::new()),
            fetcher,
            metrics,
            metrics_sender,
            scheduler,
            listeners: Arc::new(ListenerRegistry::new()),
            backup,
            scope,
            impressions,
            impression_rx: Mutex::new(Some(impression_rx)),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Replaces the backup store. Only effective before `start`.
    pub fn with_backup_store(mut self, store: Option<Arc<dyn BackupStore>>) -> Self {
        self.backup = store;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The cached enabled flag, or `default_value` for an unknown toggle.
    /// Counted in metrics either way.
    pub fn is_enabled(&self, toggle_name: &str, default_value: bool) -> bool {
        let toggle = self.cache.get(toggle_name);
        let enabled = self.evaluate(toggle_name, toggle.as_ref(), default_value);
        if self.wants_impression(toggle.as_ref()) {
            self.emit_impression(toggle_name, enabled, None);
        }
        enabled
    }

    /// The toggle's variant when it is enabled, `default_value` otherwise.
    pub fn get_variant(&self, toggle_name: &str, default_value: Variant) -> Variant {
        let toggle = self.cache.get(toggle_name);
        let enabled = self.evaluate(toggle_name, toggle.as_ref(), false);
        let variant = match toggle.as_ref().and_then(|t| t.variant.clone()) {
            Some(variant) if enabled => variant,
            _ => default_value,
        };
        let variant = self.metrics.count_variant(toggle_name, variant);
        if self.wants_impression(toggle.as_ref()) {
            self.emit_impression(toggle_name, enabled, Some(variant.name.clone()));
        }
        variant
    }

    pub fn get_toggles(&self) -> HashMap<String, Toggle> {
        self.cache.toggles()
    }

    pub fn get_context(&self) -> Context {
        self.context.borrow().clone()
    }

    /// True once any state has reached the cache.
    pub fn is_ready(&self) -> bool {
        self.cache.has_state()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Replaces the context and, once started, waits for the matching
    /// refresh to finish.
    pub async fn set_context(&self, context: Context) -> Result<()> {
        self.ensure_open()?;
        if let Some(fetcher) = self.replace_context(context) {
            fetcher.refresh_toggles().await;
        }
        Ok(())
    }

    /// Like `set_context`, giving up after `timeout`.
    ///
    /// The refresh keeps running in the background after a timeout and will
    /// still update the cache when it completes.
    pub async fn set_context_with_timeout(&self, context: Context, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let Some(fetcher) = self.replace_context(context) else {
            return Ok(());
        };

        let handle = self.scope.spawn("context refresh", async move {
            fetcher.refresh_toggles().await;
        });
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => Ok(()),
            Err(_) => Err(FlagSyncError::new(
                ErrorCode::ContextUpdateTimeout,
                format!("Context update did not complete within {:?}", timeout),
            )),
        }
    }

    /// Replaces the context without waiting; the context watcher refreshes.
    pub fn set_context_async(&self, context: Context) {
        self.context.send_if_modified(|current| {
            if *current == context {
                false
            } else {
                *current = context;
                true
            }
        });
    }

    /// Refreshes once and waits for the outcome; `None` when polling is off.
    pub async fn refresh_toggles_now(&self) -> Option<ToggleResponse> {
        let fetcher = self.fetcher.as_ref()?;
        Some(fetcher.refresh_toggles().await)
    }

    /// Like `refresh_toggles_now`, without waiting.
    pub fn refresh_toggles_now_async(&self) {
        if let Some(fetcher) = self.fetcher.clone() {
            self.scope.spawn("manual refresh", async move {
                fetcher.refresh_toggles().await;
            });
        }
    }

    /// Registers listeners, seeds the cache and starts background work.
    ///
    /// Only the first call has any effect.
    pub async fn start(&self, listeners: Vec<Listener>, bootstrap: Option<Bootstrap>) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("FlagClient is closed, ignoring start");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("FlagClient already started, ignoring start");
            return;
        }

        for listener in listeners {
            self.listeners.add(listener);
        }
        self.spawn_state_dispatcher();
        self.spawn_impression_dispatcher();
        if let Some(backup) = self.backup.clone() {
            self.spawn_backup_writer(Arc::clone(&backup));
            self.seed_from_bootstrap(bootstrap);
            self.spawn_backup_restore(backup);
        } else {
            self.seed_from_bootstrap(bootstrap);
        }

        if let Some(fetcher) = &self.fetcher {
            self.spawn_heartbeat_dispatcher(fetcher);
            self.cache.subscribe_to(fetcher.states());
            fetcher.start_watching_context(&self.scope);
        }
        self.scheduler.start().await;
        info!(
            "FlagClient started with jobs {:?}",
            self.scheduler.active_jobs().await
        );
    }

    /// Adds a listener after `start`. A ready listener added once the
    /// client is ready is called right away.
    pub fn add_listener(&self, listener: Listener) {
        self.listeners.add(listener);
    }

    pub async fn handle_lifecycle_event(&self, event: LifecycleEvent) {
        self.scheduler.handle_lifecycle_event(event).await;
    }

    pub async fn handle_network_event(&self, event: NetworkEvent) {
        self.scheduler.handle_network_event(event).await;
    }

    /// Forwards platform lifecycle events to the scheduler.
    pub fn watch_lifecycle(&self, mut events: mpsc::Receiver<LifecycleEvent>) {
        let scheduler = Arc::clone(&self.scheduler);
        self.scope.spawn("lifecycle watcher", async move {
            while let Some(event) = events.recv().await {
                scheduler.handle_lifecycle_event(event).await;
                if event == LifecycleEvent::Destroy {
                    break;
                }
            }
        });
    }

    /// Forwards connectivity events to the scheduler.
    pub fn watch_network(&self, mut events: mpsc::Receiver<NetworkEvent>) {
        let scheduler = Arc::clone(&self.scheduler);
        self.scope.spawn("network watcher", async move {
            while let Some(event) = events.recv().await {
                scheduler.handle_network_event(event).await;
            }
        });
    }

    pub fn scheduler(&self) -> &LifecycleAwareTaskManager {
        &self.scheduler
    }

    pub fn fetcher(&self) -> Option<&Arc<Fetcher>> {
        self.fetcher.as_ref()
    }

    pub fn metrics_sender(&self) -> Option<&Arc<MetricsSender>> {
        self.metrics_sender.as_ref()
    }

    /// Stops every background task. Evaluations keep serving the last state.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing FlagClient");
        self.scheduler.stop().await;
        if let Some(fetcher) = &self.fetcher {
            fetcher.close();
        }
        self.scope.cancel();
    }

    fn evaluate(&self, toggle_name: &str, toggle: Option<&Toggle>, default_value: bool) -> bool {
        let enabled = toggle.map(|t| t.enabled).unwrap_or(default_value);
        self.metrics.count(toggle_name, enabled)
    }

    fn wants_impression(&self, toggle: Option<&Toggle>) -> bool {
        (self.config.force_impression_data || toggle.is_some_and(|t| t.impression_data))
            && self.listeners.has_impression_listeners()
    }

    fn emit_impression(&self, toggle_name: &str, enabled: bool, variant: Option<String>) {
        let event = ImpressionEvent::new(toggle_name, enabled, self.get_context(), variant);
        let _ = self.impressions.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FlagSyncError::closed());
        }
        Ok(())
    }

    /// Stores `context` and returns the fetcher the caller should refresh
    /// with, if the client is started.
    ///
    /// The context is marked as requested first so the context watcher
    /// does not issue a second request for it.
    fn replace_context(&self, context: Context) -> Option<Arc<Fetcher>> {
        let fetcher = self.fetcher.clone().filter(|_| self.is_started());
        if let Some(fetcher) = &fetcher {
            fetcher.mark_requested(&context);
        }
        self.context.send_replace(context);
        fetcher
    }

    fn seed_from_bootstrap(&self, bootstrap: Option<Bootstrap>) {
        let Some(bootstrap) = bootstrap else {
            return;
        };
        match bootstrap.into_toggles() {
            Ok(toggles) => {
                debug!("Seeding cache with {} bootstrap toggles", toggles.len());
                self.cache
                    .write(FlagState::from_toggles(self.get_context(), toggles));
            }
            Err(e) => warn!("Ignoring bootstrap: {}", e),
        }
    }

    fn spawn_state_dispatcher(&self) {
        let mut updates = self.cache.updates();
        let listeners = Arc::clone(&self.listeners);
        self.scope.spawn("state dispatcher", async move {
            while updates.recv().await.is_some() {
                if !listeners.is_ready_fired() {
                    info!("Toggles received, client is ready");
                    listeners.notify_ready();
                } else {
                    debug!("Cache updated, notifying listeners that state changed");
                    listeners.notify_state_changed();
                }
            }
        });
    }

    fn spawn_impression_dispatcher(&self) {
        let Some(mut events) = self.impression_rx.lock().take() else {
            return;
        };
        let listeners = Arc::clone(&self.listeners);
        self.scope.spawn("impression dispatcher", async move {
            while let Some(event) = events.recv().await {
                listeners.notify_impression(&event);
            }
        });
    }

    fn spawn_heartbeat_dispatcher(&self, fetcher: &Fetcher) {
        let mut heartbeats = fetcher.heartbeats();
        let listeners = Arc::clone(&self.listeners);
        self.scope.spawn("heartbeat dispatcher", async move {
            while let Some(event) = heartbeats.recv().await {
                listeners.notify_heartbeat(&event);
            }
        });
    }

    fn spawn_backup_writer(&self, backup: Arc<dyn BackupStore>) {
        let mut updates = self.cache.updates();
        self.scope.spawn("backup writer", async move {
            while let Some(state) = updates.recv().await {
                let store = Arc::clone(&backup);
                let written = tokio::task::spawn_blocking(move || store.save(&state)).await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Failed to write backup: {}", e),
                    Err(e) => warn!("Backup writer task failed: {}", e),
                }
            }
        });
    }

    /// Restores the backup for the current context until the client is
    /// ready, following context changes in the meantime.
    fn spawn_backup_restore(&self, backup: Arc<dyn BackupStore>) {
        let mut context = self.context.subscribe();
        let cache = Arc::clone(&self.cache);
        self.scope.spawn("backup restore", async move {
            loop {
                if cache.has_state() {
                    break;
                }
                let current = context.borrow_and_update().clone();
                let store = Arc::clone(&backup);
                let loaded = tokio::task::spawn_blocking(move || store.load(&current))
                    .await
                    .ok()
                    .flatten();
                if let Some(state) = loaded {
                    if cache.write_if_empty(state) {
                        info!("Loaded state from backup");
                    } else {
                        debug!("Ignoring backup, client is already ready");
                    }
                    break;
                }
                if context.changed().await.is_err() {
                    break;
                }
            }
        });
    }
}

/// Client shared across tasks.
pub type SharedClient = Arc<FlagClient>;
