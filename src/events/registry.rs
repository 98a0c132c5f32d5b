//! Handler registry for managing event listeners.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Type alias for a handler function over event payload `E`
pub type HandlerFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A registered handler with its unique id
pub struct Handler<E> {
    pub id: u64,
    pub handler: HandlerFn<E>,
}

impl<E> Handler<E> {
    pub fn new(id: u64, handler: impl Fn(&E) + Send + Sync + 'static) -> Self {
        Self {
            id,
            handler: Arc::new(handler),
        }
    }

    pub fn invoke(&self, event: &E) {
        (self.handler)(event);
    }
}

impl<E> Clone for Handler<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("id", &self.id).finish()
    }
}

/// Registry storing handlers per event key plus a global list.
///
/// Handler ids are unique across both sections, so an id alone is enough
/// to remove a listener.
#[derive(Debug)]
pub struct HandlerRegistry<E> {
    /// Key-specific handlers: key -> [handlers]
    handlers: DashMap<String, Vec<Handler<E>>>,
    /// Global handlers that receive every event
    global_handlers: RwLock<Vec<Handler<E>>>,
    /// Counter for generating unique handler ids
    next_id: std::sync::atomic::AtomicU64,
}

impl<E> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> HandlerRegistry<E> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            global_handlers: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Generate a unique handler id
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Add a handler for a specific key
    pub fn add(&self, key: impl Into<String>, handler: impl Fn(&E) + Send + Sync + 'static) -> u64 {
        let id = self.next_id();
        let h = Handler::new(id, handler);

        self.handlers.entry(key.into()).or_default().push(h);

        id
    }

    /// Add a global handler that receives all events
    pub fn add_global(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> u64 {
        let id = self.next_id();
        let h = Handler::new(id, handler);

        self.global_handlers.write().push(h);

        id
    }

    /// Get handlers for a specific key
    pub fn get(&self, key: &str) -> Vec<Handler<E>> {
        self.handlers.get(key).map(|v| v.clone()).unwrap_or_default()
    }

    /// Get global handlers, in registration order
    pub fn get_global(&self) -> Vec<Handler<E>> {
        self.global_handlers.read().clone()
    }

    /// Remove handlers by key and/or id
    pub fn remove(&self, key: Option<&str>, handler_id: Option<u64>) {
        match (key, handler_id) {
            (Some(key), Some(id)) => {
                if let Some(mut handlers) = self.handlers.get_mut(key) {
                    handlers.retain(|h| h.id != id);
                }
            }
            (Some(key), None) => {
                self.handlers.remove(key);
            }
            (None, Some(id)) => {
                for mut entry in self.handlers.iter_mut() {
                    entry.retain(|h| h.id != id);
                }
                self.global_handlers.write().retain(|h| h.id != id);
            }
            (None, None) => {
                self.handlers.clear();
                self.global_handlers.write().clear();
            }
        }
    }

    /// Remove a global handler by id, or all of them
    pub fn remove_global(&self, handler_id: Option<u64>) {
        if let Some(id) = handler_id {
            self.global_handlers.write().retain(|h| h.id != id);
        } else {
            self.global_handlers.write().clear();
        }
    }

    /// Remove all handlers
    pub fn clear(&self) {
        self.handlers.clear();
        self.global_handlers.write().clear();
    }

    /// Check if any handler is registered for a key
    pub fn has_handlers(&self, key: &str) -> bool {
        self.handlers.get(key).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Total number of registered handlers
    pub fn handler_count(&self) -> usize {
        let keyed: usize = self.handlers.iter().map(|v| v.len()).sum();
        let global = self.global_handlers.read().len();
        keyed + global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_and_get_handler() {
        let registry = HandlerRegistry::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        registry.add("test-event", move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handlers = registry.get("test-event");
        assert_eq!(handlers.len(), 1);

        handlers[0].invoke(&"payload".to_string());

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_handler() {
        let registry = HandlerRegistry::<String>::new();
        registry.add_global(|_| {});

        assert_eq!(registry.get_global().len(), 1);
    }

    #[test]
    fn test_ids_unique_across_sections() {
        let registry = HandlerRegistry::<String>::new();
        let a = registry.add("x", |_| {});
        let b = registry.add_global(|_| {});
        let c = registry.add("y", |_| {});
        assert!(a != b && b != c && a != c);
    }

    #[test]
    fn test_remove_handler() {
        let registry = HandlerRegistry::<String>::new();

        let id = registry.add("test-event", |_| {});
        assert!(registry.has_handlers("test-event"));

        registry.remove(Some("test-event"), Some(id));
        assert!(!registry.has_handlers("test-event"));
    }

    #[test]
    fn test_remove_by_id_only() {
        let registry = HandlerRegistry::<String>::new();

        let keep = registry.add("a", |_| {});
        let drop = registry.add("b", |_| {});

        registry.remove(None, Some(drop));

        assert!(registry.has_handlers("a"));
        assert!(!registry.has_handlers("b"));
        let _ = keep;
    }

    #[test]
    fn test_clear() {
        let registry = HandlerRegistry::<String>::new();

        registry.add("event1", |_| {});
        registry.add("event2", |_| {});
        registry.add_global(|_| {});

        assert_eq!(registry.handler_count(), 3);

        registry.clear();

        assert_eq!(registry.handler_count(), 0);
    }
}
