//! Event dispatcher for managing listeners and emitting events.

use super::registry::HandlerRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event dispatcher that manages listener bindings and event emission.
///
/// Emission order is fixed: global listeners run first, then listeners bound
/// to the event's key, each in registration order. A panicking listener is
/// caught and logged so it cannot take down the driver task that emitted.
pub struct EventDispatcher<E> {
    handlers: Arc<HandlerRegistry<E>>,
}

impl<E> Clone for EventDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventDispatcher<E> {
    /// Create a new event dispatcher
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Bind a listener to a specific event key
    pub fn bind(
        &self,
        key: impl Into<String>,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> u64 {
        let key = key.into();
        debug!("Binding listener for '{}'", key);
        self.handlers.add(key, handler)
    }

    /// Bind a listener to all events
    pub fn bind_global(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> u64 {
        debug!("Binding global listener");
        self.handlers.add_global(handler)
    }

    /// Unbind listeners by key and/or id
    pub fn unbind(&self, key: Option<&str>, handler_id: Option<u64>) {
        debug!("Unbinding listener: key={:?}, id={:?}", key, handler_id);
        self.handlers.remove(key, handler_id);
    }

    /// Unbind global listeners
    pub fn unbind_global(&self, handler_id: Option<u64>) {
        debug!("Unbinding global listener: id={:?}", handler_id);
        self.handlers.remove_global(handler_id);
    }

    /// Unbind all listeners
    pub fn unbind_all(&self) {
        debug!("Unbinding all listeners");
        self.handlers.clear();
    }

    /// Emit an event under a key to all registered listeners
    pub fn emit(&self, key: &str, event: &E) {
        for handler in self.handlers.get_global() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.invoke(event);
            })) {
                warn!("Global listener panicked: {:?}", e);
            }
        }

        for handler in self.handlers.get(key) {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.invoke(event);
            })) {
                warn!("Listener for '{}' panicked: {:?}", key, e);
            }
        }
    }

    /// Check if any listener is bound for a key
    pub fn has_handlers(&self, key: &str) -> bool {
        self.handlers.has_handlers(key)
    }

    /// Total number of bound listeners
    pub fn handler_count(&self) -> usize {
        self.handlers.handler_count()
    }
}

impl<E> std::fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_bind_and_emit() {
        let dispatcher = EventDispatcher::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        dispatcher.bind("test-event", move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit("test-event", &"data".to_string());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_bind() {
        let dispatcher = EventDispatcher::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        dispatcher.bind_global(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit("event1", &"a".to_string());
        dispatcher.emit("event2", &"b".to_string());

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_runs_before_keyed() {
        let dispatcher = EventDispatcher::<String>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_clone = order.clone();
        dispatcher.bind("evt", move |_| order_clone.lock().push("keyed"));
        let order_clone = order.clone();
        dispatcher.bind_global(move |_| order_clone.lock().push("global"));

        dispatcher.emit("evt", &"x".to_string());

        assert_eq!(*order.lock(), vec!["global", "keyed"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let dispatcher = EventDispatcher::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.bind("evt", |_| panic!("listener bug"));
        let counter_clone = counter.clone();
        dispatcher.bind("evt", move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit("evt", &"x".to_string());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbind() {
        let dispatcher = EventDispatcher::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let id = dispatcher.bind("test-event", move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit("test-event", &"x".to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        dispatcher.unbind(Some("test-event"), Some(id));

        dispatcher.emit("test-event", &"x".to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
