use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{ErrorCode, FlagSyncError, Result};

/// Polling and metrics interval when none is given.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5000);
/// Upper bound on how long throttling may silence a job.
pub const LONGEST_ACCEPTABLE_INTERVAL: Duration = Duration::from_secs(300);
/// Reported to the server in the `UNLEASH-SDK` header.
pub const SDK_NAME: &str = "flagsync";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How and when a background job talks to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStrategy {
    pub enabled: bool,
    /// Time between two runs of the job.
    pub interval: Duration,
    /// Time before the first run after the job (re)starts.
    pub delay: Duration,
    pub pause_on_background: bool,
    pub http_connection_timeout: Duration,
    pub http_read_timeout: Duration,
    pub http_custom_headers: HashMap<String, String>,
}

impl Default for DataStrategy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_INTERVAL,
            delay: Duration::ZERO,
            pause_on_background: true,
            http_connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            http_read_timeout: DEFAULT_READ_TIMEOUT,
            http_custom_headers: HashMap::new(),
        }
    }
}

impl DataStrategy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// A strategy whose job never runs.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// When false the job keeps running while the app is in the background.
    pub fn pause_on_background(mut self, pause: bool) -> Self {
        self.pause_on_background = pause;
        self
    }

    pub fn http_connection_timeout(mut self, timeout: Duration) -> Self {
        self.http_connection_timeout = timeout;
        self
    }

    pub fn http_read_timeout(mut self, timeout: Duration) -> Self {
        self.http_read_timeout = timeout;
        self
    }

    /// Adds a custom header sent with every request of this job.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_custom_headers.insert(name.into(), value.into());
        self
    }
}

/// Where the last known flag state is kept between runs.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStorageConfig {
    pub enabled: bool,
    /// Backup directory; the system temp dir when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl LocalStorageConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: None,
        }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            dir: Some(dir.into()),
        }
    }

    /// The configured directory, or `flagsync_backup` under the system temp dir.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("flagsync_backup"))
    }
}

/// Client settings. Build with `ClientConfig::builder` and check with
/// `validate`, which `FlagClient` does on construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub proxy_url: Option<String>,
    pub client_key: Option<String>,
    pub app_name: String,
    pub instance_id: String,
    pub polling_strategy: DataStrategy,
    pub metrics_strategy: DataStrategy,
    pub local_storage: LocalStorageConfig,
    /// Emit impression events for every evaluation, not only for toggles
    /// that ask for it.
    pub force_impression_data: bool,
}

impl ClientConfig {
    pub fn new(
        app_name: impl Into<String>,
        proxy_url: impl Into<String>,
        client_key: impl Into<String>,
    ) -> Self {
        Self::builder(app_name)
            .proxy_url(proxy_url)
            .client_key(client_key)
            .build()
    }

    pub fn builder(app_name: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(app_name)
    }

    /// Checks required fields, urls and intervals.
    pub fn validate(&self) -> Result<()> {
        let needs_server = self.polling_strategy.enabled || self.metrics_strategy.enabled;

        if needs_server {
            let proxy_url = self.proxy_url.as_deref().unwrap_or_default();
            let client_key = self.client_key.as_deref().unwrap_or_default();
            if proxy_url.is_empty() || client_key.is_empty() {
                return Err(FlagSyncError::config_error(
                    ErrorCode::ConfigMissingRequired,
                    "You must either set proxy_url and client_key or disable both polling and metrics",
                ));
            }
            Url::parse(proxy_url).map_err(|e| {
                FlagSyncError::with_source(
                    ErrorCode::ConfigInvalidUrl,
                    format!("Invalid proxy url: {}", proxy_url),
                    e,
                )
            })?;
        }

        for (name, strategy) in [
            ("polling", &self.polling_strategy),
            ("metrics", &self.metrics_strategy),
        ] {
            if strategy.enabled && strategy.interval.is_zero() {
                return Err(FlagSyncError::config_error(
                    ErrorCode::ConfigInvalidInterval,
                    format!("The {} interval must be positive", name),
                ));
            }
        }

        Ok(())
    }

    pub(crate) fn proxy_url(&self) -> Result<Url> {
        let raw = self.proxy_url.as_deref().unwrap_or_default();
        Url::parse(raw).map_err(|e| {
            FlagSyncError::with_source(
                ErrorCode::ConfigInvalidUrl,
                format!("Invalid proxy url: {}", raw),
                e,
            )
        })
    }

    pub(crate) fn metrics_url(&self) -> Result<Url> {
        let mut url = self.proxy_url()?;
        url.path_segments_mut()
            .map_err(|_| {
                FlagSyncError::config_error(ErrorCode::ConfigInvalidUrl, "Proxy url cannot be a base")
            })?
            .pop_if_empty()
            .push("client")
            .push("metrics");
        Ok(url)
    }

    /// Headers attached to every request made with `strategy`.
    ///
    /// Custom headers come first so they can never replace the ones the
    /// server relies on.
    pub fn application_headers(&self, strategy: &DataStrategy) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = strategy
            .http_custom_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.extend([
            (
                "Authorization".to_string(),
                self.client_key.clone().unwrap_or_default(),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("UNLEASH-APPNAME".to_string(), self.app_name.clone()),
            ("User-Agent".to_string(), self.app_name.clone()),
            ("UNLEASH-INSTANCEID".to_string(), self.instance_id.clone()),
            (
                "UNLEASH-SDK".to_string(),
                format!("{}:{}", SDK_NAME, SDK_VERSION),
            ),
        ]);
        headers
    }
}

/// Builder for `ClientConfig`.
///
/// Unset fields keep their defaults; a missing instance id is generated.
pub struct ClientConfigBuilder {
    app_name: String,
    proxy_url: Option<String>,
    client_key: Option<String>,
    instance_id: Option<String>,
    polling_strategy: DataStrategy,
    metrics_strategy: DataStrategy,
    local_storage: LocalStorageConfig,
    force_impression_data: bool,
}

impl ClientConfigBuilder {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            proxy_url: None,
            client_key: None,
            instance_id: None,
            polling_strategy: DataStrategy::default(),
            metrics_strategy: DataStrategy::default(),
            local_storage: LocalStorageConfig::default(),
            force_impression_data: false,
        }
    }

    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    pub fn client_key(mut self, key: impl Into<String>) -> Self {
        self.client_key = Some(key.into());
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn polling_strategy(mut self, strategy: DataStrategy) -> Self {
        self.polling_strategy = strategy;
        self
    }

    pub fn metrics_strategy(mut self, strategy: DataStrategy) -> Self {
        self.metrics_strategy = strategy;
        self
    }

    pub fn local_storage(mut self, config: LocalStorageConfig) -> Self {
        self.local_storage = config;
        self
    }

    /// Emit impression events for every toggle, not only those flagged
    /// with `impressionData`.
    pub fn force_impression_data(mut self, force: bool) -> Self {
        self.force_impression_data = force;
        self
    }

    pub fn build(self) -> ClientConfig {
        ClientConfig {
            proxy_url: self.proxy_url,
            client_key: self.client_key,
            app_name: self.app_name,
            instance_id: self
                .instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            polling_strategy: self.polling_strategy,
            metrics_strategy: self.metrics_strategy,
            local_storage: self.local_storage,
            force_impression_data: self.force_impression_data,
        }
    }
}
