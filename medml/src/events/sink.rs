//! Event sinks.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info, Level};

/// One lifecycle event as a sink received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// One of the names in [`super::types`].
    pub event_type: String,
    /// Payload, usually carrying `node_id` or `page_id`.
    pub data: Option<Value>,
}

impl RecordedEvent {
    /// The `node_id` field of the payload.
    pub fn node_id(&self) -> Option<&str> {
        self.data.as_ref()?.get("node_id")?.as_str()
    }
}

/// Receives node and experiment lifecycle events.
///
/// The engine calls [`EventSink::emit`] inline on the thread running the
/// experiment, so implementations must return quickly and never fail.
pub trait EventSink: Debug + Send + Sync {
    /// Receives one event.
    fn emit(&self, event_type: &str, data: Option<Value>);
}

/// Drops every event. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs at `level`; anything other than `DEBUG` logs at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        let node_id = data
            .as_ref()
            .and_then(|d| d.get("node_id"))
            .and_then(Value::as_str)
            .unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(event_type, node_id, data = ?data, "experiment event");
        } else {
            info!(event_type, node_id, data = ?data, "experiment event");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Events whose type starts with `prefix`.
    pub fn of_type(&self, prefix: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// How many `event_type` events named `node_id`.
    pub fn count_for_node(&self, event_type: &str, node_id: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type && e.node_id() == Some(node_id))
            .count()
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing arrived.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Forgets every event.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
        });
    }
}
