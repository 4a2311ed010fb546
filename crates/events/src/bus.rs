//! Where coordinator events go.
//!
//! The coordinator emits through `EventBus` so it can run under a UI shell,
//! a headless CLI or a test harness without change.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Sink for `(topic, payload)` pairs. Implementations must not block.
pub trait EventBus: Send + Sync {
    /// `topic` is one of the constants in [`crate::topics`].
    fn emit(&self, topic: &str, payload: serde_json::Value);
}

/// Shared handle used by the coordinator and its tasks.
pub type EventBusRef = Arc<dyn EventBus>;

/// Serialize a typed payload and emit it.
pub fn emit<T: Serialize>(bus: &dyn EventBus, topic: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => bus.emit(topic, value),
        Err(e) => tracing::warn!(topic, error = %e, "failed to serialize event payload"),
    }
}

/// Keeps every event so tests can assert on what the session reported.
#[derive(Default)]
pub struct InMemoryEventBus {
    events: Mutex<Vec<EmittedEvent>>,
}

/// One recorded emission.
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, oldest first.
    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, topic: &str) -> Vec<EmittedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of events captured for a topic.
    pub fn count(&self, topic: &str) -> usize {
        self.events.lock().iter().filter(|e| e.topic == topic).count()
    }

    /// Topics in emission order.
    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.topic.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventBus for InMemoryEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.events.lock().push(EmittedEvent {
            topic: topic.to_string(),
            payload,
        });
    }
}

/// Drops everything.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _topic: &str, _payload: serde_json::Value) {}
}

/// Payload keys that carry user speech and must not reach the logs.
const REDACTED_KEYS: &[&str] = &["text", "display_text", "source_text"];

/// Event bus that writes every event to the tracing log.
///
/// Speech content is replaced by its length before logging.
pub struct TracingEventBus;

impl TracingEventBus {
    fn redact(mut payload: serde_json::Value) -> serde_json::Value {
        if let serde_json::Value::Object(map) = &mut payload {
            for key in REDACTED_KEYS {
                let len = match map.get(*key) {
                    Some(serde_json::Value::String(text)) => text.chars().count(),
                    _ => continue,
                };
                map.insert((*key).to_string(), serde_json::json!({ "redacted_len": len }));
            }
        }
        payload
    }
}

impl EventBus for TracingEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        let payload = Self::redact(payload);
        tracing::info!(target: "parley::events", topic, %payload, "event");
    }
}

/// Fan an event out to several buses.
pub struct FanoutEventBus {
    buses: Vec<EventBusRef>,
}

impl FanoutEventBus {
    pub fn new(buses: Vec<EventBusRef>) -> Self {
        Self { buses }
    }
}

impl EventBus for FanoutEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        for bus in &self.buses {
            bus.emit(topic, payload.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_in_order() {
        let bus = InMemoryEventBus::new();
        bus.emit("turn:phrase_commit", json!({"utterance": 1}));
        bus.emit("speech:start", json!({"queue_depth": 0}));
        bus.emit("turn:phrase_commit", json!({"utterance": 2}));

        assert_eq!(
            bus.topics(),
            vec!["turn:phrase_commit", "speech:start", "turn:phrase_commit"]
        );
        assert_eq!(bus.count("turn:phrase_commit"), 2);
        assert_eq!(bus.events_for("speech:start")[0].payload["queue_depth"], 0);
        assert_eq!(bus.count("speech:end"), 0);

        bus.clear();
        assert!(bus.is_empty() && bus.len() == 0);
    }

    #[test]
    fn test_typed_emit() {
        #[derive(Serialize)]
        struct Payload {
            depth: usize,
        }

        let bus = InMemoryEventBus::new();
        emit(&bus, "queue:depth_alert", &Payload { depth: 6 });
        assert_eq!(bus.events()[0].payload, json!({"depth": 6}));
    }

    #[test]
    fn test_redacts_speech_text() {
        let redacted = TracingEventBus::redact(json!({"text": "hola", "phrase_id": "x"}));
        assert_eq!(redacted, json!({"text": {"redacted_len": 4}, "phrase_id": "x"}));
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(InMemoryEventBus::new());
        let b = Arc::new(InMemoryEventBus::new());
        let fanout = FanoutEventBus::new(vec![
            a.clone() as EventBusRef,
            b.clone() as EventBusRef,
            Arc::new(NullEventBus) as EventBusRef,
        ]);
        fanout.emit("speech:start", json!({}));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
