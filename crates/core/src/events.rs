use crate::types::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A lifecycle event emitted by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    IdleTimeout,
    Explicit,
    Replaced,
    Error,
    Shutdown,
}

/// Types of events that can occur in the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Server lifecycle events
    ServerStarted {
        transports: Vec<String>,
        startup_ms: u64,
    },
    ServerStopped,

    // Transport events
    TransportStarted {
        transport: String,
    },
    TransportStopped {
        transport: String,
    },
    TransportError {
        transport: String,
        message: String,
    },

    // Session events
    SessionCreated {
        session_id: SessionId,
        client_name: String,
    },
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
    SessionExpired {
        session_id: SessionId,
    },

    // Tool call events
    ToolCallStarted {
        tool: String,
        session_id: Option<SessionId>,
    },
    ToolCallCompleted {
        tool: String,
        session_id: Option<SessionId>,
        success: bool,
        duration_ms: u64,
    },
}

/// Fan-out channel for lifecycle events.
///
/// Emitting never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event_type: EventType) {
        tracing::trace!(event = ?event_type, "Lifecycle event");
        let _ = self.tx.send(Event::new(event_type));
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
