use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::types::{HeartbeatEvent, ImpressionEvent, Status};

/// Called once, when the first state reaches the cache.
pub trait ReadyListener: Send + Sync {
    fn on_ready(&self);
}

/// Called on every cache update after the first.
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self);
}

/// Called for each evaluation of a toggle that carries impression data.
pub trait ImpressionListener: Send + Sync {
    fn on_impression(&self, event: &ImpressionEvent);
}

/// Told about every refresh attempt, whether or not it changed anything.
pub trait HeartbeatListener: Send + Sync {
    fn on_error(&self, event: &HeartbeatEvent);
    fn toggles_checked(&self);
    fn toggles_updated(&self);
}

/// Convenience listener covering ready, state and impression events.
pub trait EventListener: Send + Sync {
    fn on_ready(&self) {}
    fn on_state_changed(&self) {}
    fn on_impression(&self, _event: &ImpressionEvent) {}
}

impl<F: Fn() + Send + Sync> ReadyListener for F {
    fn on_ready(&self) {
        self()
    }
}

impl<F: Fn() + Send + Sync> StateListener for F {
    fn on_state_changed(&self) {
        self()
    }
}

impl<F: Fn(&ImpressionEvent) + Send + Sync> ImpressionListener for F {
    fn on_impression(&self, event: &ImpressionEvent) {
        self(event)
    }
}

/// Anything that can be handed to `FlagClient::start`.
#[derive(Clone)]
pub enum Listener {
    Ready(Arc<dyn ReadyListener>),
    State(Arc<dyn StateListener>),
    Impression(Arc<dyn ImpressionListener>),
    Heartbeat(Arc<dyn HeartbeatListener>),
    Event(Arc<dyn EventListener>),
}

impl Listener {
    pub fn ready(f: impl Fn() + Send + Sync + 'static) -> Self {
        Listener::Ready(Arc::new(f))
    }

    pub fn state(f: impl Fn() + Send + Sync + 'static) -> Self {
        Listener::State(Arc::new(f))
    }

    pub fn impression(f: impl Fn(&ImpressionEvent) + Send + Sync + 'static) -> Self {
        Listener::Impression(Arc::new(f))
    }

    pub fn heartbeat(listener: impl HeartbeatListener + 'static) -> Self {
        Listener::Heartbeat(Arc::new(listener))
    }

    pub fn event(listener: impl EventListener + 'static) -> Self {
        Listener::Event(Arc::new(listener))
    }
}

struct EventAdapter(Arc<dyn EventListener>);

impl ReadyListener for EventAdapter {
    fn on_ready(&self) {
        self.0.on_ready()
    }
}

impl StateListener for EventAdapter {
    fn on_state_changed(&self) {
        self.0.on_state_changed()
    }
}

impl ImpressionListener for EventAdapter {
    fn on_impression(&self, event: &ImpressionEvent) {
        self.0.on_impression(event)
    }
}

#[derive(Default)]
struct ReadyListeners {
    fired: bool,
    listeners: Vec<Arc<dyn ReadyListener>>,
}

/// Registered listeners by kind. Panics in a listener are logged and
/// contained.
///
/// Ready fires once. A ready listener added after that is called on the
/// spot, so every ready listener is called exactly once.
#[derive(Default)]
pub struct ListenerRegistry {
    ready: RwLock<ReadyListeners>,
    state: RwLock<Vec<Arc<dyn StateListener>>>,
    impression: RwLock<Vec<Arc<dyn ImpressionListener>>>,
    heartbeat: RwLock<Vec<Arc<dyn HeartbeatListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener`. An `Event` listener is registered for ready,
    /// state and impression events.
    pub fn add(&self, listener: Listener) {
        match listener {
            Listener::Ready(l) => self.add_ready(l),
            Listener::State(l) => self.state.write().push(l),
            Listener::Impression(l) => self.impression.write().push(l),
            Listener::Heartbeat(l) => self.heartbeat.write().push(l),
            Listener::Event(l) => {
                let adapter = Arc::new(EventAdapter(l));
                self.state.write().push(adapter.clone());
                self.impression.write().push(adapter.clone());
                self.add_ready(adapter);
            }
        }
    }

    fn add_ready(&self, listener: Arc<dyn ReadyListener>) {
        {
            let mut ready = self.ready.write();
            if !ready.fired {
                ready.listeners.push(listener);
                return;
            }
        }
        guarded("ready", || listener.on_ready());
    }

    pub fn is_ready_fired(&self) -> bool {
        self.ready.read().fired
    }

    /// Impression events are only built when this is true.
    pub fn has_impression_listeners(&self) -> bool {
        !self.impression.read().is_empty()
    }

    /// Fires ready listeners; false when ready had already fired.
    pub fn notify_ready(&self) -> bool {
        let listeners = {
            let mut ready = self.ready.write();
            if ready.fired {
                return false;
            }
            ready.fired = true;
            ready.listeners.clone()
        };
        for listener in listeners {
            guarded("ready", || listener.on_ready());
        }
        true
    }

    pub fn notify_state_changed(&self) {
        let listeners = self.state.read().clone();
        for listener in listeners {
            guarded("state", || listener.on_state_changed());
        }
    }

    pub fn notify_impression(&self, event: &ImpressionEvent) {
        let listeners = self.impression.read().clone();
        for listener in listeners {
            guarded("impression", || listener.on_impression(event));
        }
    }

    /// Routes a heartbeat by status: updated, checked or error.
    pub fn notify_heartbeat(&self, event: &HeartbeatEvent) {
        let listeners = self.heartbeat.read().clone();
        for listener in listeners {
            guarded("heartbeat", || match event.status {
                Status::Success => listener.toggles_updated(),
                Status::NotModified => listener.toggles_checked(),
                Status::Failed | Status::Throttled => listener.on_error(event),
                Status::Superseded => {}
            });
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("A {} listener panicked", kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Context;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl HeartbeatListener for Recorder {
        fn on_error(&self, event: &HeartbeatEvent) {
            self.calls.lock().push(format!("error:{:?}", event.status));
        }
        fn toggles_checked(&self) {
            self.calls.lock().push("checked".to_string());
        }
        fn toggles_updated(&self) {
            self.calls.lock().push("updated".to_string());
        }
    }

    impl EventListener for Recorder {
        fn on_ready(&self) {
            self.calls.lock().push("ready".to_string());
        }
    }

    #[test]
    fn test_heartbeat_classification() {
        let registry = ListenerRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add(Listener::Heartbeat(recorder.clone()));

        registry.notify_heartbeat(&HeartbeatEvent::new(Status::Success));
        registry.notify_heartbeat(&HeartbeatEvent::new(Status::NotModified));
        registry.notify_heartbeat(&HeartbeatEvent::new(Status::Throttled));

        assert_eq!(
            *recorder.calls.lock(),
            vec!["updated", "checked", "error:Throttled"]
        );
    }

    #[test]
    fn test_event_listener_defaults() {
        let registry = ListenerRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add(Listener::Event(recorder.clone()));

        registry.notify_ready();
        registry.notify_state_changed();
        registry.notify_impression(&ImpressionEvent::new("f", true, Context::new(), None));

        assert_eq!(*recorder.calls.lock(), vec!["ready"]);
        assert!(registry.has_impression_listeners());
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        registry.add(Listener::ready(|| panic!("listener bug")));
        registry.add(Listener::ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.notify_ready();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ready_fires_once() {
        let registry = ListenerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        registry.add(Listener::ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.notify_ready());
        assert!(!registry.notify_ready());
        assert!(registry.is_ready_fired());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_ready_listener_called_immediately() {
        let registry = ListenerRegistry::new();
        registry.notify_ready();
        let recorder = Arc::new(Recorder::default());

        registry.add(Listener::Event(recorder.clone()));
        assert_eq!(*recorder.calls.lock(), vec!["ready"]);
    }

    #[test]
    fn test_ready_listeners_added_concurrently_called_once() {
        let registry = Arc::new(ListenerRegistry::new());
        let counts: Vec<Arc<AtomicUsize>> =
            (0..64).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let adders: Vec<_> = counts
            .chunks(16)
            .map(|chunk| {
                let registry = Arc::clone(&registry);
                let chunk: Vec<_> = chunk.to_vec();
                std::thread::spawn(move || {
                    for count in chunk {
                        registry.add(Listener::ready(move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();
        let notifier = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.notify_ready())
        };
        for adder in adders {
            adder.join().unwrap();
        }
        assert!(notifier.join().unwrap());

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
