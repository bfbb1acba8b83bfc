use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::publisher::{Publisher, Subscription};
use crate::types::{FlagState, Toggle};

/// Latest flag-state snapshot with change notification.
///
/// Reads clone an `Arc` under a short read lock and never wait on the
/// network. Writes swap the whole snapshot, so readers see either the old
/// state or the new one, never a mix.
pub struct ObservableCache {
    snapshot: RwLock<Option<Arc<FlagState>>>,
    updates: Publisher<Arc<FlagState>>,
    write_lock: Mutex<()>,
}

impl ObservableCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(None),
            updates: Publisher::replaying(),
            write_lock: Mutex::new(()),
        }
    }

    /// The toggle from the current snapshot, if any.
    pub fn get(&self, name: &str) -> Option<Toggle> {
        self.snapshot
            .read()
            .as_ref()
            .and_then(|state| state.get(name).cloned())
    }

    pub fn read(&self) -> Option<Arc<FlagState>> {
        self.snapshot.read().clone()
    }

    pub fn toggles(&self) -> HashMap<String, Toggle> {
        self.read()
            .map(|state| state.toggles.clone())
            .unwrap_or_default()
    }

    /// True once any state has been written.
    pub fn has_state(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// Replaces the snapshot and notifies subscribers.
    pub fn write(&self, state: FlagState) {
        let state = Arc::new(state);
        // Serializes writers so notification order matches snapshot order.
        let _guard = self.write_lock.lock();
        *self.snapshot.write() = Some(Arc::clone(&state));
        self.updates.publish(state);
    }

    /// Writes `state` only if nothing has been written yet.
    pub fn write_if_empty(&self, state: FlagState) -> bool {
        let _guard = self.write_lock.lock();
        if self.snapshot.read().is_some() {
            return false;
        }
        let state = Arc::new(state);
        *self.snapshot.write() = Some(Arc::clone(&state));
        self.updates.publish(state);
        true
    }

    /// Wires an upstream producer directly into `write`.
    pub fn subscribe_to(self: &Arc<Self>, upstream: &Publisher<FlagState>) {
        let cache = Arc::downgrade(self);
        upstream.connect(Arc::new(move |state: &FlagState| {
            if let Some(cache) = cache.upgrade() {
                cache.write(state.clone());
            }
        }));
    }

    /// Every state written from now on, preceded by the current one if any.
    pub fn updates(&self) -> Subscription<Arc<FlagState>> {
        self.updates.subscribe()
    }
}

impl Default for ObservableCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Context;

    fn state(user: &str, toggles: &[(&str, bool)]) -> FlagState {
        FlagState::from_toggles(
            Context::with_user_id(user),
            toggles.iter().map(|(n, e)| Toggle::new(*n, *e)).collect(),
        )
    }

    #[test]
    fn test_get_before_any_write() {
        let cache = ObservableCache::new();
        assert!(cache.get("x").is_none());
        assert!(!cache.has_state());
    }

    #[test]
    fn test_write_replaces_snapshot() {
        let cache = ObservableCache::new();
        cache.write(state("a", &[("one", true), ("two", false)]));
        cache.write(state("a", &[("three", true)]));

        assert!(cache.get("one").is_none());
        assert!(cache.get("three").unwrap().enabled);
        assert_eq!(cache.toggles().len(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_current_state() {
        let cache = ObservableCache::new();
        cache.write(state("a", &[("one", true)]));
        cache.write(state("b", &[("one", false)]));

        let mut updates = cache.updates();
        let current = updates.recv().await.unwrap();
        assert_eq!(current.context.user_id.as_deref(), Some("b"));
        assert!(updates.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_to_upstream() {
        let cache = Arc::new(ObservableCache::new());
        let upstream = Publisher::new();
        cache.subscribe_to(&upstream);

        upstream.publish(state("a", &[("flag", true)]));
        assert!(cache.get("flag").unwrap().enabled);
    }
}
