use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

/// The attributes the server evaluates toggles against.
///
/// A context is a value: every change produces a new `Context` and the
/// client swaps it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Returns a builder seeded with this context's fields.
    pub fn to_builder(&self) -> ContextBuilder {
        ContextBuilder {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            remote_address: self.remote_address.clone(),
            properties: self.properties.clone(),
        }
    }

    pub fn with_user_id(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.session_id.is_none()
            && self.remote_address.is_none()
            && self.properties.is_empty()
    }

    /// Deterministic identity over every field.
    ///
    /// Properties are hashed in key order so two contexts that compare equal
    /// always produce the same id, regardless of map iteration order.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.user_id, &self.session_id, &self.remote_address] {
            match field {
                Some(value) => {
                    hasher.update([1u8]);
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
                None => hasher.update([0u8]),
            }
        }
        let sorted: BTreeMap<&String, &String> = self.properties.iter().collect();
        for (key, value) in sorted {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextBuilder {
    user_id: Option<String>,
    session_id: Option<String>,
    remote_address: Option<String>,
    properties: HashMap<String, String>,
}

impl ContextBuilder {
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn build(self) -> Context {
        Context {
            user_id: self.user_id,
            session_id: self.session_id,
            remote_address: self.remote_address,
            properties: self.properties,
        }
    }
}
