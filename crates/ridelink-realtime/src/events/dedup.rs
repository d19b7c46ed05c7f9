//! Idempotency filter for at-least-once inbound delivery.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tracing::debug;

/// Remembered identifiers, newest at the back.
#[derive(Debug, Default)]
struct SeenIds {
    set: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded set of recently processed event identifiers.
///
/// Once the set grows past its capacity it keeps only the newest half, so
/// an identifier missing from the set is not proof that the event is new.
#[derive(Debug)]
pub struct IdempotencyFilter {
    /// Maximum remembered identifiers.
    capacity: usize,
    /// Identifiers in insertion order.
    seen: Mutex<SeenIds>,
}

impl IdempotencyFilter {
    /// Create a filter with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    /// Check if an event should be dispatched.
    ///
    /// Events without an identifier always pass.
    pub fn should_process(&self, event_id: Option<&str>) -> bool {
        match event_id {
            Some(id) => {
                let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
                !seen.set.contains(id)
            }
            None => true,
        }
    }

    /// Remember an identifier as processed.
    pub fn mark_processed(&self, event_id: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if !seen.set.insert(event_id.to_string()) {
            return;
        }
        seen.order.push_back(event_id.to_string());

        if seen.order.len() > self.capacity {
            let keep = self.capacity / 2;
            let drop = seen.order.len() - keep;
            for _ in 0..drop {
                if let Some(old) = seen.order.pop_front() {
                    seen.set.remove(&old);
                }
            }
            debug!(kept = keep, dropped = drop, "Idempotency window trimmed");
        }
    }

    /// Check and mark in one step. Returns `true` if the event is new.
    pub fn check_and_mark(&self, event_id: Option<&str>) -> bool {
        match event_id {
            Some(id) => {
                if !self.should_process(Some(id)) {
                    return false;
                }
                self.mark_processed(id);
                true
            }
            None => true,
        }
    }

    /// Number of remembered identifiers
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything
    pub fn clear(&self) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.set.clear();
        seen.order.clear();
    }
}
