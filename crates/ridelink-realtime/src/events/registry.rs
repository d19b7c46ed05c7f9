//! Handler registry: typed publish/subscribe for channel events.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::signal::{ChannelEvent, EventKind};

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Token returned by [`HandlerRegistry::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Event kind → handlers in registration order.
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one handler, or every handler of `kind` when `id` is `None`.
    ///
    /// Returns the number of handlers removed.
    pub fn off(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = handlers.get_mut(&kind) else {
            return 0;
        };

        let before = list.len();
        match id {
            Some(id) => list.retain(|(existing, _)| *existing != id),
            None => list.clear(),
        }
        let removed = before - list.len();

        if list.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Delivers an event to every handler registered for its kind.
    ///
    /// Handlers are snapshotted before the first call, so handlers may
    /// subscribe or unsubscribe from inside a callback without affecting
    /// the current pass. Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        let Some(kind) = event.kind() else {
            return 0;
        };

        let snapshot: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(kind = %kind, handlers = snapshot.len(), "Dispatching event");

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Removes every handler.
    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
