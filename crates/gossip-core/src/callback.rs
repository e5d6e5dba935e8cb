//! Key-pattern subscriptions
//!
//! An ordered table of (pattern, handler) pairs. Every accepted write into the
//! info store calls [`CallbackRegistry::notify`], which runs the matching
//! handlers inline on the writer's thread, in registration order. Handlers sit
//! on the writer's critical path (usually under the node mutex) and must not
//! block; a subscriber that needs to do real work should hand off through a
//! bounded channel and coalesce there.

use crate::error::Result;
use crate::types::Value;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::{Arc, Weak};

/// Handler invoked with the key and the newly accepted value.
pub type CallbackFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Entry {
    id: u64,
    pattern: Regex,
    handler: CallbackFn,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Subscription table shared between the info store and its subscribers.
#[derive(Default)]
pub struct CallbackRegistry {
    inner: Mutex<RegistryInner>,
}

impl CallbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe `handler` to keys matching the regular expression `pattern`.
    ///
    /// The match is unanchored, so `"^node:"` selects node address keys and
    /// `".*"` selects everything. The subscription lives until the returned
    /// handle is unregistered or dropped.
    pub fn register<F>(self: &Arc<Self>, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let pattern = Regex::new(pattern)?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Entry {
            id,
            pattern,
            handler: Arc::new(handler),
        });

        Ok(Subscription {
            id,
            registry: Arc::downgrade(self),
        })
    }

    /// Run every handler whose pattern matches `key`. Returns how many ran.
    pub fn notify(&self, key: &str, value: &Value) -> usize {
        // Snapshot first so a handler may register or unregister without
        // deadlocking on the table.
        let handlers: Vec<CallbackFn> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.pattern.is_match(key))
            .map(|entry| entry.handler.clone())
            .collect();

        for handler in &handlers {
            handler(key, value);
        }
        handlers.len()
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.inner.lock().entries.retain(|entry| entry.id != id);
    }
}

/// Handle for one registered callback.
///
/// Dropping the handle removes the subscription; [`Subscription::unregister`]
/// does the same explicitly.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    registry: Weak<CallbackRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription now.
    pub fn unregister(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&str, &Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = count.clone();
        (count, move |_: &str, _: &Value| {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_pattern_matching() {
        let registry = CallbackRegistry::new();
        let (nodes, on_node) = counter();
        let (all, on_any) = counter();
        let _node_sub = registry.register("^node:", on_node).unwrap();
        let _all_sub = registry.register(".*", on_any).unwrap();

        let value = Value::new("node:1", vec![], 1);
        assert_eq!(registry.notify("node:1", &value), 2);
        assert_eq!(registry.notify("cluster-id", &value), 1);

        assert_eq!(nodes.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister_and_drop() {
        let registry = CallbackRegistry::new();
        let (count, handler) = counter();
        let first = registry.register(".*", handler).unwrap();
        let (_, handler) = counter();
        let second = registry.register(".*", handler).unwrap();
        assert_eq!(registry.len(), 2);
        assert_ne!(first.id(), second.id());

        first.unregister();
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());

        registry.notify("k", &Value::new("k", vec![], 1));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_pattern() {
        let registry = CallbackRegistry::new();
        let result = registry.register("(", |_: &str, _: &Value| {});
        assert!(matches!(result, Err(crate::Error::InvalidPattern(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let registry = CallbackRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_handle = slot.clone();
        let sub = registry
            .register(".*", move |_: &str, _: &Value| {
                slot_handle.lock().take();
            })
            .unwrap();
        *slot.lock() = Some(sub);

        registry.notify("k", &Value::new("k", vec![], 1));
        assert!(registry.is_empty());
    }
}
