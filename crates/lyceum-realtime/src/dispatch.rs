//! Type-keyed dispatch registry with wildcard observation.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::error;

use lyceum_common::events;

use crate::types::Envelope;

type Handler = Arc<dyn Fn(Value) + Send + Sync + 'static>;
type Registry = HashMap<String, HashMap<u64, Handler>>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes inbound envelopes to subscribers by event type.
///
/// Handlers for a type form a set, not a slot: several subscriptions may
/// coexist for one type and invocation order is unspecified. Handlers
/// registered under [`events::WILDCARD`] receive every envelope, independent
/// of type-specific routing. A panicking handler is isolated and logged; it
/// never affects sibling handlers or the connection.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `event`. Returns a handle that removes exactly
    /// this registration.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(event.to_string())
            .or_default()
            .insert(id, Arc::new(handler));

        Subscription {
            registry: Arc::downgrade(&self.handlers),
            event: event.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver one parsed envelope to all matching subscribers.
    ///
    /// Type-specific handlers receive `data` if present, else the whole
    /// envelope; wildcard handlers always receive the raw envelope.
    pub(crate) fn publish(&self, envelope: &Envelope) {
        let (typed, wildcard) = {
            let registry = self.lock();
            let typed: Vec<Handler> = if envelope.event == events::WILDCARD {
                Vec::new()
            } else {
                registry
                    .get(&envelope.event)
                    .map(|set| set.values().cloned().collect())
                    .unwrap_or_default()
            };
            let wildcard: Vec<Handler> = registry
                .get(events::WILDCARD)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default();
            (typed, wildcard)
        };

        if !typed.is_empty() {
            let payload = envelope.handler_payload();
            for handler in &typed {
                invoke(handler, payload.clone(), &envelope.event);
            }
        }

        if !wildcard.is_empty() {
            let raw = envelope.to_raw();
            for handler in &wildcard {
                invoke(handler, raw.clone(), events::WILDCARD);
            }
        }
    }

    #[cfg(test)]
    fn handler_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, HashMap::len)
    }
}

fn invoke(handler: &Handler, payload: Value, event: &str) {
    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
        error!(event = %event, "subscriber panicked while handling envelope");
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle for one (event, handler) registration.
///
/// Dropping the handle does not unsubscribe; the handler stays registered
/// until [`unsubscribe`](Self::unsubscribe) is called or the client is
/// dropped.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Remove this registration. Idempotent; other subscriptions for the
    /// same event are unaffected.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(registry) = self.registry.upgrade() {
                let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(set) = registry.get_mut(&self.event) {
                    set.remove(&self.id);
                    if set.is_empty() {
                        registry.remove(&self.event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn envelope(json: &str) -> Envelope {
        serde_json::from_str(json).unwrap()
    }

    fn collector() -> (Arc<StdMutex<Vec<Value>>>, impl Fn(Value) + Send + Sync) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v| sink.lock().unwrap().push(v))
    }

    #[test]
    fn routes_by_type_with_data_payload() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (seen, handler) = collector();
        let _sub = dispatcher.subscribe("notification", handler);

        dispatcher.publish(&envelope(
            r#"{"type":"notification","data":{"id":1,"title":"Hi"}}"#,
        ));
        dispatcher.publish(&envelope(r#"{"type":"homework_update","data":{"id":2}}"#));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], serde_json::json!({"id":1,"title":"Hi"}));
    }

    #[test]
    fn missing_data_delivers_full_envelope() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (seen, handler) = collector();
        let _sub = dispatcher.subscribe("unknown_type", handler);

        dispatcher.publish(&envelope(r#"{"type":"unknown_type"}"#));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].get("type"), Some(&serde_json::json!("unknown_type")));
    }

    #[test]
    fn wildcard_sees_every_envelope() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (typed_seen, typed) = collector();
        let (wild_seen, wild) = collector();
        let _a = dispatcher.subscribe("notification", typed);
        let _b = dispatcher.subscribe(events::WILDCARD, wild);

        dispatcher.publish(&envelope(r#"{"type":"notification","data":{"id":1}}"#));
        dispatcher.publish(&envelope(r#"{"type":"unknown_type"}"#));

        assert_eq!(typed_seen.lock().unwrap().len(), 1);
        let wild = wild_seen.lock().unwrap();
        assert_eq!(wild.len(), 2);
        // Wildcard receives the raw envelope, not the data payload.
        assert_eq!(wild[0].get("type"), Some(&serde_json::json!("notification")));
    }

    #[test]
    fn multiple_handlers_per_type() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (first, a) = collector();
        let (second, b) = collector();
        let _a = dispatcher.subscribe("notification", a);
        let _b = dispatcher.subscribe("notification", b);

        dispatcher.publish(&envelope(r#"{"type":"notification","data":1}"#));

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_registration() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (first, a) = collector();
        let (second, b) = collector();
        let sub_a = dispatcher.subscribe("notification", a);
        let _sub_b = dispatcher.subscribe("notification", b);

        sub_a.unsubscribe();
        dispatcher.publish(&envelope(r#"{"type":"notification","data":1}"#));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.handler_count("notification"), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (_, a) = collector();
        let (second, b) = collector();
        let sub_a = dispatcher.subscribe("notification", a);
        let _sub_b = dispatcher.subscribe("notification", b);

        sub_a.unsubscribe();
        sub_a.unsubscribe();
        sub_a.unsubscribe();

        dispatcher.publish(&envelope(r#"{"type":"notification","data":1}"#));
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn no_delivery_after_unsubscribe() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (seen, handler) = collector();
        let sub = dispatcher.subscribe("notification", handler);

        dispatcher.publish(&envelope(r#"{"type":"notification","data":1}"#));
        sub.unsubscribe();
        dispatcher.publish(&envelope(r#"{"type":"notification","data":2}"#));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], serde_json::json!(1));
    }

    #[test]
    fn panicking_handler_does_not_block_siblings() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (seen, good) = collector();
        let (wild_seen, wild) = collector();
        let _bad = dispatcher.subscribe("notification", |_| panic!("boom"));
        let _good = dispatcher.subscribe("notification", good);
        let _wild = dispatcher.subscribe(events::WILDCARD, wild);

        dispatcher.publish(&envelope(r#"{"type":"notification","data":1}"#));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(wild_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_type_entry_is_pruned() {
        let dispatcher = Arc::new(Dispatcher::default());
        let (_, handler) = collector();
        let sub = dispatcher.subscribe("notification", handler);
        sub.unsubscribe();
        assert!(dispatcher.lock().get("notification").is_none());
    }
}
