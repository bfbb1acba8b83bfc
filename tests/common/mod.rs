//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use flagsync::{
    ClientConfig, DataStrategy, FlagSyncError, HttpRequest, HttpResponse, LocalStorageConfig,
    Result, Transport,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const PROXY_URL: &str = "https://proxy.example/api/frontend";

pub enum Reply {
    Response(HttpResponse),
    Delayed(Duration, HttpResponse),
    NetworkError,
}

/// In-memory transport answering from a script.
///
/// Requests to the metrics endpoint are recorded separately and always get
/// `metrics_status`, so polling scripts are not disturbed by metrics ticks.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<HttpResponse>,
    pub metrics_status: Mutex<u16>,
    pub toggle_requests: Mutex<Vec<HttpRequest>>,
    pub metrics_requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(fallback: HttpResponse) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            metrics_status: Mutex::new(202),
            toggle_requests: Mutex::new(Vec::new()),
            metrics_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub fn set_fallback(&self, response: HttpResponse) {
        *self.fallback.lock() = response;
    }

    pub fn toggle_request_count(&self) -> usize {
        self.toggle_requests.lock().len()
    }

    pub fn metrics_bodies(&self) -> Vec<serde_json::Value> {
        self.metrics_requests
            .lock()
            .iter()
            .filter_map(|r| r.body.as_ref())
            .filter_map(|b| serde_json::from_slice(b).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        if request.url.path().ends_with("/client/metrics") {
            self.metrics_requests.lock().push(request);
            return Ok(HttpResponse::new(*self.metrics_status.lock()));
        }

        self.toggle_requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Reply::NetworkError) => Err(FlagSyncError::new(
                flagsync::ErrorCode::NetworkError,
                "connection refused",
            )),
            None => Ok(self.fallback.lock().clone()),
        }
    }
}

pub fn toggles_body(toggles: &[(&str, bool)]) -> HttpResponse {
    let toggles: Vec<serde_json::Value> = toggles
        .iter()
        .map(|(name, enabled)| serde_json::json!({"name": name, "enabled": enabled}))
        .collect();
    HttpResponse::new(200).with_body(serde_json::json!({ "toggles": toggles }).to_string())
}

pub fn not_modified() -> HttpResponse {
    HttpResponse::new(304)
}

/// Config with long intervals so only explicit refreshes hit the transport.
pub fn quiet_config() -> ClientConfig {
    ClientConfig::builder("test-app")
        .proxy_url(PROXY_URL)
        .client_key("client-key")
        .instance_id("instance-1")
        .polling_strategy(DataStrategy::new(Duration::from_secs(3600)).delay(Duration::from_secs(3600)))
        .metrics_strategy(DataStrategy::disabled())
        .local_storage(LocalStorageConfig::disabled())
        .build()
}

/// Waits until `condition` holds, polling every 10ms for up to 2s.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
