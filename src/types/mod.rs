use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod context;

pub use context::{Context, ContextBuilder};

/// Typed payload attached to a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub value: String,
}

impl Payload {
    pub fn new(payload_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.trim().parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.trim().parse().ok()
    }

    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.value).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "feature_enabled", alias = "featureEnabled")]
    pub feature_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

fn default_true() -> bool {
    true
}

impl Variant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            feature_enabled: false,
            payload: None,
        }
    }

    /// The variant reported when a toggle is off or unknown.
    pub fn disabled() -> Self {
        Self {
            name: "disabled".to_string(),
            enabled: false,
            feature_enabled: false,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self::disabled()
    }
}

/// An already evaluated toggle as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toggle {
    pub name: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    #[serde(default)]
    pub impression_data: bool,
}

impl Toggle {
    pub fn new(name: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            enabled,
            variant: None,
            impression_data: false,
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn with_impression_data(mut self, impression_data: bool) -> Self {
        self.impression_data = impression_data;
        self
    }
}

/// Body of a successful evaluation response, also the bootstrap file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(default)]
    pub toggles: Vec<Toggle>,
}

impl ProxyResponse {
    /// Indexes toggles by name; on duplicate names the last one wins.
    pub fn into_toggle_map(self) -> HashMap<String, Toggle> {
        let mut map = HashMap::with_capacity(self.toggles.len());
        for toggle in self.toggles {
            map.insert(toggle.name.clone(), toggle);
        }
        map
    }
}

/// The context that was evaluated together with everything it produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagState {
    pub context: Context,
    pub toggles: HashMap<String, Toggle>,
}

impl FlagState {
    pub fn new(context: Context, toggles: HashMap<String, Toggle>) -> Self {
        Self { context, toggles }
    }

    pub fn from_toggles(context: Context, toggles: Vec<Toggle>) -> Self {
        Self {
            context,
            toggles: ProxyResponse { toggles }.into_toggle_map(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Toggle> {
        self.toggles.get(name)
    }

    pub fn len(&self) -> usize {
        self.toggles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toggles.is_empty()
    }
}

/// Outcome of one refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    NotModified,
    Failed,
    Throttled,
    /// A newer request took over before this one finished.
    Superseded,
}

impl Status {
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    pub fn is_not_modified(&self) -> bool {
        *self == Status::NotModified
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Status::Failed | Status::Throttled)
    }

    pub fn is_superseded(&self) -> bool {
        *self == Status::Superseded
    }
}

/// Per-attempt status signal published by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub status: Status,
    pub message: Option<String>,
}

impl HeartbeatEvent {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            message: None,
        }
    }

    pub fn with_message(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Recorded when a toggle with impression tracking is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionEvent {
    pub event_id: String,
    pub feature_name: String,
    pub enabled: bool,
    pub context: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ImpressionEvent {
    pub fn new(
        feature_name: impl Into<String>,
        enabled: bool,
        context: Context,
        variant: Option<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            feature_name: feature_name.into(),
            enabled,
            context,
            variant,
        }
    }
}
