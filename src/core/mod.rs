mod cache;
mod config;
mod fetcher;
mod listeners;
mod metrics;
mod publisher;
mod scheduler;
mod scope;
mod throttler;

pub use cache::ObservableCache;
pub use config::{
    ClientConfig, ClientConfigBuilder, DataStrategy, LocalStorageConfig,
    DEFAULT_CONNECTION_TIMEOUT, DEFAULT_INTERVAL, DEFAULT_READ_TIMEOUT,
    LONGEST_ACCEPTABLE_INTERVAL, SDK_NAME, SDK_VERSION,
};
pub use fetcher::{Fetcher, ToggleResponse};
pub use listeners::{
    EventListener, HeartbeatListener, ImpressionListener, Listener, ListenerRegistry,
    ReadyListener, StateListener,
};
pub use metrics::{
    Bucket, EvaluationCount, MetricsAggregator, MetricsBucket, MetricsCollector, MetricsPayload,
    MetricsReporter, MetricsSender, NoOpMetrics,
};
pub use publisher::{Publisher, Sink, Subscription};
pub use scheduler::{DataJob, JobAction, LifecycleAwareTaskManager, LifecycleEvent, NetworkEvent};
pub use scope::TaskScope;
pub use throttler::Throttler;
