//! Ordered subscriber registry keyed by event type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Callback invoked with the `data` of a matching event.
///
/// Registrations are identified by the `Arc` allocation, so keep the handle
/// returned by [`event_callback`] to unsubscribe later.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Wraps a closure into an [`EventCallback`] handle.
pub fn event_callback<F>(callback: F) -> EventCallback
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(callback)
}

/// Event type to callbacks, in registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    by_type: HashMap<String, Vec<EventCallback>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event_type: &str, callback: EventCallback) {
        self.by_type
            .entry(event_type.to_string())
            .or_default()
            .push(callback);
    }

    /// Removes the earliest registration of `callback` for `event_type`.
    ///
    /// Returns whether a registration was removed. A callback registered
    /// twice needs two calls.
    pub fn unsubscribe(&mut self, event_type: &str, callback: &EventCallback) -> bool {
        let Some(callbacks) = self.by_type.get_mut(event_type) else {
            return false;
        };
        let Some(index) = callbacks
            .iter()
            .position(|registered| Arc::ptr_eq(registered, callback))
        else {
            return false;
        };

        callbacks.remove(index);
        if callbacks.is_empty() {
            self.by_type.remove(event_type);
        }
        true
    }

    /// Snapshot of the callbacks for `event_type`, in invocation order.
    pub fn callbacks_for(&self, event_type: &str) -> Vec<EventCallback> {
        self.by_type.get(event_type).cloned().unwrap_or_default()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.by_type.get(event_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }
}
