//! Evaluation counters and their periodic upload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::config::ClientConfig;
use super::throttler::Throttler;
use crate::error::{ErrorCode, FlagSyncError, Result};
use crate::http::{HttpRequest, Transport};
use crate::types::Variant;

/// Counts evaluations as they happen.
pub trait MetricsCollector: Send + Sync {
    fn count(&self, feature_name: &str, enabled: bool) -> bool;
    fn count_variant(&self, feature_name: &str, variant: Variant) -> Variant;
}

/// Ships accumulated counts to the server.
#[async_trait]
pub trait MetricsReporter: Send + Sync {
    async fn send_metrics(&self);
}

/// Counts for one toggle within a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationCount {
    pub yes: u64,
    pub no: u64,
    #[serde(default)]
    pub variants: HashMap<String, u64>,
}

/// Closed window of evaluation counts, as posted to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub toggles: HashMap<String, EvaluationCount>,
}

/// Body of a metrics upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub app_name: String,
    pub instance_id: String,
    pub bucket: Bucket,
}

/// Live counters for one time window.
#[derive(Debug)]
pub struct MetricsBucket {
    start: DateTime<Utc>,
    yes: DashMap<String, AtomicU64>,
    no: DashMap<String, AtomicU64>,
    variants: DashMap<(String, String), AtomicU64>,
}

impl MetricsBucket {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            yes: DashMap::new(),
            no: DashMap::new(),
            variants: DashMap::new(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn count(&self, feature_name: &str, enabled: bool) {
        let counters = if enabled { &self.yes } else { &self.no };
        increment(counters, feature_name.to_string());
    }

    pub fn count_variant(&self, feature_name: &str, variant_name: &str) {
        increment(
            &self.variants,
            (feature_name.to_string(), variant_name.to_string()),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.yes.is_empty() && self.no.is_empty() && self.variants.is_empty()
    }

    /// Snapshot of the counters as a bucket ending at `stop`.
    pub fn to_bucket(&self, stop: DateTime<Utc>) -> Bucket {
        let mut toggles: HashMap<String, EvaluationCount> = HashMap::new();
        for entry in self.yes.iter() {
            toggles.entry(entry.key().clone()).or_default().yes = entry.value().load(Ordering::SeqCst);
        }
        for entry in self.no.iter() {
            toggles.entry(entry.key().clone()).or_default().no = entry.value().load(Ordering::SeqCst);
        }
        for entry in self.variants.iter() {
            let (feature, variant) = entry.key();
            toggles
                .entry(feature.clone())
                .or_default()
                .variants
                .insert(variant.clone(), entry.value().load(Ordering::SeqCst));
        }
        Bucket {
            start: self.start,
            stop,
            toggles,
        }
    }
}

fn increment<K: std::hash::Hash + Eq>(counters: &DashMap<K, AtomicU64>, key: K) {
    counters
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::SeqCst);
}

/// Swappable bucket shared by every evaluating thread.
///
/// Increments hold the read side of the lock; `flush` takes the write side
/// to swap, so no increment can straddle two buckets.
#[derive(Debug)]
pub struct MetricsAggregator {
    live: RwLock<Arc<MetricsBucket>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(Arc::new(MetricsBucket::new(Utc::now()))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live.read().is_empty()
    }

    /// Swaps in a fresh bucket and returns the closed one.
    pub fn flush(&self) -> Bucket {
        let stop = Utc::now();
        let closed = {
            let mut live = self.live.write();
            std::mem::replace(&mut *live, Arc::new(MetricsBucket::new(stop)))
        };
        closed.to_bucket(stop)
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for MetricsAggregator {
    fn count(&self, feature_name: &str, enabled: bool) -> bool {
        self.live.read().count(feature_name, enabled);
        enabled
    }

    fn count_variant(&self, feature_name: &str, variant: Variant) -> Variant {
        self.live.read().count_variant(feature_name, &variant.name);
        variant
    }
}

/// Counts evaluations and periodically posts them to the metrics endpoint.
pub struct MetricsSender {
    metrics_url: Url,
    app_name: String,
    instance_id: String,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    aggregator: MetricsAggregator,
    throttler: Throttler,
}

impl MetricsSender {
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let metrics_url = config.metrics_url()?;
        let throttler = Throttler::new(
            format!("metrics {}", metrics_url),
            config.metrics_strategy.interval,
        );
        Ok(Self {
            metrics_url,
            app_name: config.app_name.clone(),
            instance_id: config.instance_id.clone(),
            headers: config.application_headers(&config.metrics_strategy),
            transport,
            aggregator: MetricsAggregator::new(),
            throttler,
        })
    }

    pub fn aggregator(&self) -> &MetricsAggregator {
        &self.aggregator
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Flushes the live bucket and posts it.
    ///
    /// Returns `Ok(false)` when nothing was sent: throttled ticks keep
    /// accumulating and empty buckets are never posted.
    pub async fn try_send_metrics(&self) -> Result<bool> {
        if !self.throttler.perform_action() {
            self.throttler.skipped();
            info!("Skipping metrics send due to throttling");
            return Ok(false);
        }
        if self.aggregator.is_empty() {
            debug!("No evaluations recorded, skipping metrics send");
            return Ok(false);
        }

        let payload = MetricsPayload {
            app_name: self.app_name.clone(),
            instance_id: self.instance_id.clone(),
            bucket: self.aggregator.flush(),
        };
        let body = serde_json::to_vec(&payload).map_err(|e| {
            FlagSyncError::with_source(ErrorCode::MetricsSendFailed, "Failed to encode metrics", e)
        })?;
        let request = HttpRequest::post(self.metrics_url.clone(), body)
            .headers(self.headers.iter().cloned());

        let response = self.transport.send(request).await?;
        self.throttler.handle(response.status);
        if !response.is_success() {
            return Err(FlagSyncError::new(
                ErrorCode::MetricsSendFailed,
                format!("Metrics endpoint returned {}", response.status),
            ));
        }
        debug!(
            "Sent metrics for {} toggles",
            payload.bucket.toggles.len()
        );
        Ok(true)
    }
}

impl MetricsCollector for MetricsSender {
    fn count(&self, feature_name: &str, enabled: bool) -> bool {
        self.aggregator.count(feature_name, enabled)
    }

    fn count_variant(&self, feature_name: &str, variant: Variant) -> Variant {
        self.aggregator.count_variant(feature_name, variant)
    }
}

#[async_trait]
impl MetricsReporter for MetricsSender {
    async fn send_metrics(&self) {
        if let Err(e) = self.try_send_metrics().await {
            warn!("Failed to report metrics: {}", e);
        }
    }
}

/// Stand-in used when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn count(&self, _feature_name: &str, enabled: bool) -> bool {
        enabled
    }

    fn count_variant(&self, _feature_name: &str, variant: Variant) -> Variant {
        variant
    }
}

#[async_trait]
impl MetricsReporter for NoOpMetrics {
    async fn send_metrics(&self) {}
}
