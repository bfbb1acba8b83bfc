//! Toggle fetching for the current context.
//!
//! One request is in flight at a time. Starting a new one cancels the
//! previous request, which then reports `Status::Superseded` and leaves no
//! trace in the cache, the throttler or the heartbeat stream.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use super::config::ClientConfig;
use super::publisher::{Publisher, Subscription};
use super::scope::TaskScope;
use super::throttler::Throttler;
use crate::error::{ErrorCode, FlagSyncError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::types::{Context, FlagState, HeartbeatEvent, ProxyResponse, Status, Toggle};

/// Result of one refresh attempt.
#[derive(Debug)]
pub struct ToggleResponse {
    pub status: Status,
    pub toggles: HashMap<String, Toggle>,
    pub error: Option<FlagSyncError>,
}

impl ToggleResponse {
    fn new(status: Status) -> Self {
        Self {
            status,
            toggles: HashMap::new(),
            error: None,
        }
    }

    fn failed(error: FlagSyncError) -> Self {
        Self {
            status: Status::Failed,
            toggles: HashMap::new(),
            error: Some(error),
        }
    }

    /// True when new toggles were fetched.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

enum Fetched {
    Toggles(HashMap<String, Toggle>),
    NotModified,
}

/// Fetches evaluated toggles for the current context.
pub struct Fetcher {
    proxy_url: Url,
    app_name: String,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    context: watch::Receiver<Context>,
    throttler: Throttler,
    etag: Mutex<Option<String>>,
    /// Context of the most recent request, used to skip redundant refreshes.
    last_requested: Mutex<Option<Context>>,
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
    next_call: AtomicU64,
    states: Publisher<FlagState>,
    heartbeats: Publisher<HeartbeatEvent>,
    closed: CancellationToken,
}

impl Fetcher {
    /// Builds a fetcher that requests toggles for the context held in
    /// `context`. Fails when the proxy url cannot be parsed.
    pub fn new(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        context: watch::Receiver<Context>,
    ) -> Result<Self> {
        let proxy_url = config.proxy_url()?;
        let throttler = Throttler::new(
            format!("fetcher {}", proxy_url),
            config.polling_strategy.interval,
        );
        Ok(Self {
            headers: config.application_headers(&config.polling_strategy),
            app_name: config.app_name.clone(),
            proxy_url,
            transport,
            context,
            throttler,
            etag: Mutex::new(None),
            last_requested: Mutex::new(None),
            in_flight: Mutex::new(None),
            next_call: AtomicU64::new(0),
            states: Publisher::new(),
            heartbeats: Publisher::new(),
            closed: CancellationToken::new(),
        })
    }

    /// States produced by successful fetches.
    pub fn states(&self) -> &Publisher<FlagState> {
        &self.states
    }

    /// One event per refresh attempt, superseded attempts excluded.
    pub fn heartbeats(&self) -> Subscription<HeartbeatEvent> {
        self.heartbeats.subscribe()
    }

    /// Backoff state for toggle requests.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// ETag of the last successful response, sent back as `If-None-Match`.
    pub fn etag(&self) -> Option<String> {
        self.etag.lock().clone()
    }

    /// Context of the most recent toggle request, started or about to start.
    pub fn last_requested(&self) -> Option<Context> {
        self.last_requested.lock().clone()
    }

    /// Records `context` as requested so the context watcher does not
    /// refresh for it again.
    pub(crate) fn mark_requested(&self, context: &Context) {
        *self.last_requested.lock() = Some(context.clone());
    }

    /// Refreshes toggles for the current context unless throttled.
    pub async fn refresh_toggles(&self) -> ToggleResponse {
        if self.closed.is_cancelled() {
            return ToggleResponse::failed(FlagSyncError::closed());
        }
        if !self.throttler.perform_action() {
            self.throttler.skipped();
            info!("Skipping refresh toggles due to throttling");
            self.heartbeats
                .publish(HeartbeatEvent::with_message(Status::Throttled, "throttled"));
            return ToggleResponse::new(Status::Throttled);
        }
        debug!("Refreshing toggles");
        let context = self.context.borrow().clone();
        self.refresh_toggles_with_context(context).await
    }

    async fn refresh_toggles_with_context(&self, context: Context) -> ToggleResponse {
        self.mark_requested(&context);
        let mut request = HttpRequest::get(self.build_context_url(&context))
            .headers(self.headers.iter().cloned());
        if let Some(etag) = self.etag() {
            request = request.headers([("If-None-Match".to_string(), etag)]);
        }

        let (call_id, token) = self.begin_call();
        debug!("Fetching toggles from {}", request.url);

        let result = tokio::select! {
            _ = token.cancelled() => None,
            result = self.transport.send(request) => Some(result),
        };
        let Some(result) = result else {
            debug!("Fetch {} was superseded", call_id);
            return ToggleResponse::new(Status::Superseded);
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if !self.end_call(call_id, &token) {
                    return ToggleResponse::new(Status::Superseded);
                }
                info!("Failed to fetch toggles: {}", e);
                self.heartbeats
                    .publish(HeartbeatEvent::with_message(Status::Failed, e.to_string()));
                return ToggleResponse::failed(e);
            }
        };

        debug!("Received status code {} from {}", response.status, self.proxy_url);
        let outcome = {
            let mut in_flight = self.in_flight.lock();
            if token.is_cancelled() {
                return ToggleResponse::new(Status::Superseded);
            }
            if matches!(in_flight.as_ref(), Some((id, _)) if *id == call_id) {
                *in_flight = None;
            }
            self.throttler.handle(response.status);
            let outcome = self.read_response(response);
            // Published while holding the slot so a newer call cannot land first.
            if let Ok(Fetched::Toggles(toggles)) = &outcome {
                debug!(
                    "Fetched new state with {} toggles, publishing",
                    toggles.len()
                );
                self.states
                    .publish(FlagState::new(context, toggles.clone()));
            }
            outcome
        };

        match outcome {
            Ok(Fetched::Toggles(toggles)) => {
                self.heartbeats.publish(HeartbeatEvent::new(Status::Success));
                ToggleResponse {
                    status: Status::Success,
                    toggles,
                    error: None,
                }
            }
            Ok(Fetched::NotModified) => {
                self.heartbeats
                    .publish(HeartbeatEvent::new(Status::NotModified));
                ToggleResponse::new(Status::NotModified)
            }
            Err(e) => {
                if e.is_unauthorized() {
                    error!("Not authorized to fetch toggles. Double check your client key");
                } else {
                    info!("Failed to fetch toggles: {}", e);
                }
                self.heartbeats
                    .publish(HeartbeatEvent::with_message(Status::Failed, e.to_string()));
                ToggleResponse::failed(e)
            }
        }
    }

    /// Triggers a refresh in the background whenever the context changes
    /// to a value other than the one last requested.
    ///
    /// The value current at call time is considered seen.
    pub fn start_watching_context(self: &Arc<Self>, scope: &TaskScope) {
        let mut context = self.context.clone();
        context.borrow_and_update();
        let fetcher = Arc::clone(self);
        let refresh_scope = scope.clone();
        scope.spawn("context watcher", async move {
            while context.changed().await.is_ok() {
                let current = context.borrow_and_update().clone();
                if fetcher.last_requested().as_ref() == Some(&current) {
                    debug!("Context already requested, skipping refresh");
                    continue;
                }
                debug!("Context changed, refreshing toggles");
                let fetcher = Arc::clone(&fetcher);
                refresh_scope.spawn("context refresh", async move {
                    fetcher.refresh_toggles().await;
                });
            }
        });
    }

    /// Cancels the in-flight request and rejects later ones.
    pub fn close(&self) {
        self.closed.cancel();
        if let Some((_, token)) = self.in_flight.lock().take() {
            token.cancel();
        }
    }

    fn begin_call(&self) -> (u64, CancellationToken) {
        let id = self.next_call.fetch_add(1, Ordering::SeqCst);
        let token = self.closed.child_token();
        let previous = self.in_flight.lock().replace((id, token.clone()));
        if let Some((previous_id, previous_token)) = previous {
            debug!("Cancelling previous fetch {}", previous_id);
            previous_token.cancel();
        }
        (id, token)
    }

    /// Releases the in-flight slot; false when a newer call took over.
    fn end_call(&self, id: u64, token: &CancellationToken) -> bool {
        let mut in_flight = self.in_flight.lock();
        if token.is_cancelled() {
            return false;
        }
        if matches!(in_flight.as_ref(), Some((current, _)) if *current == id) {
            *in_flight = None;
        }
        true
    }

    fn read_response(&self, response: HttpResponse) -> Result<Fetched> {
        match response.status {
            200..=299 => {
                *self.etag.lock() = response.header("etag").map(str::to_string);
                let body = response.body.ok_or_else(FlagSyncError::no_body)?;
                let parsed: ProxyResponse = serde_json::from_slice(&body).map_err(|e| {
                    FlagSyncError::with_source(
                        ErrorCode::HttpInvalidResponse,
                        format!("Failed to parse toggles: {}", e),
                        e,
                    )
                })?;
                Ok(Fetched::Toggles(parsed.into_toggle_map()))
            }
            304 => Ok(Fetched::NotModified),
            401 => Err(FlagSyncError::unauthorized()),
            status => Err(FlagSyncError::from_status(status)),
        }
    }

    fn build_context_url(&self, context: &Context) -> Url {
        let mut url = self.proxy_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("appName", &self.app_name);
            if let Some(user_id) = &context.user_id {
                query.append_pair("userId", user_id);
            }
            if let Some(remote_address) = &context.remote_address {
                query.append_pair("remoteAddress", remote_address);
            }
            if let Some(session_id) = &context.session_id {
                query.append_pair("sessionId", session_id);
            }
            let mut properties: Vec<_> = context.properties.iter().collect();
            properties.sort();
            for (key, value) in properties {
                query.append_pair(&format!("properties[{}]", key), value);
            }
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::ScriptedTransport;
    use std::time::Duration;

    const BODY: &str = r#"{"toggles":[{"name":"flag","enabled":true}]}"#;

    fn fetcher(transport: Arc<ScriptedTransport>) -> (Fetcher, watch::Sender<Context>) {
        let config = ClientConfig::new("test-app", "https://proxy.example/api/frontend", "key");
        let (tx, rx) = watch::channel(Context::new());
        (Fetcher::new(&config, transport, rx).unwrap(), tx)
    }

    #[test]
    fn test_context_url_query() {
        let transport = Arc::new(ScriptedTransport::new(HttpResponse::new(304)));
        let (fetcher, _tx) = fetcher(transport);
        let context = Context::builder()
            .user_id("u1")
            .session_id("s1")
            .remote_address("1.2.3.4")
            .property("plan", "gold")
            .build();

        let url = fetcher.build_context_url(&context);
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["appName"], "test-app");
        assert_eq!(pairs["userId"], "u1");
        assert_eq!(pairs["sessionId"], "s1");
        assert_eq!(pairs["remoteAddress"], "1.2.3.4");
        assert_eq!(pairs["properties[plan]"], "gold");
    }

    #[tokio::test]
    async fn test_etag_sent_on_next_request() {
        let transport = Arc::new(ScriptedTransport::new(HttpResponse::new(304)));
        transport.push(
            HttpResponse::new(200)
                .with_header("ETag", "\"v1\"")
                .with_body(BODY),
        );
        let (fetcher, _tx) = fetcher(Arc::clone(&transport));

        assert!(fetcher.refresh_toggles().await.is_success());
        let second = fetcher.refresh_toggles().await;
        assert_eq!(second.status, Status::NotModified);

        let requests = transport.requests.lock();
        assert_eq!(requests[0].header("If-None-Match"), None);
        assert_eq!(requests[1].header("If-None-Match"), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_superseded_call_is_silent() {
        let transport = Arc::new(ScriptedTransport::new(HttpResponse::new(304)));
        transport.push_delayed(
            Duration::from_millis(200),
            Ok(HttpResponse::new(500)),
        );
        transport.push(HttpResponse::new(200).with_body(BODY));
        let (fetcher, _tx) = fetcher(transport);
        let fetcher = Arc::new(fetcher);
        let mut heartbeats = fetcher.heartbeats();

        let slow = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.refresh_toggles().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = fetcher.refresh_toggles().await;

        assert_eq!(fast.status, Status::Success);
        assert_eq!(slow.await.unwrap().status, Status::Superseded);
        assert_eq!(fetcher.throttler().failures(), 0);
        assert_eq!(heartbeats.recv().await.unwrap().status, Status::Success);
        assert!(heartbeats.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unparseable_body_fails_without_publishing() {
        let transport = Arc::new(ScriptedTransport::new(HttpResponse::new(200).with_body("{not json")));
        let (fetcher, _tx) = fetcher(transport);
        let mut states = fetcher.states().subscribe();

        let response = fetcher.refresh_toggles().await;
        assert_eq!(response.status, Status::Failed);
        assert_eq!(response.error.unwrap().code, ErrorCode::HttpInvalidResponse);
        assert!(states.try_recv().is_none());
    }
}
