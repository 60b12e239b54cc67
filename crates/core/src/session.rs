//! Per-client session tracking with idle expiry.
//!
//! A session is created by a successful `initialize` handshake and lives in
//! the table until it is closed, explicitly or by its idle timer. Closed
//! sessions are removed, so every lookup of a closed id fails with
//! [`CoreError::SessionNotFound`] and the caller must handshake again.

use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{CloseReason, EventBus, EventType};
use crate::metrics::ServerMetrics;
use crate::types::{ClientInfo, SessionId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Closed,
}

/// Server-side record of one client's handshake and activity window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub client_info: ClientInfo,
    pub capabilities: serde_json::Value,
    pub protocol_version: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

struct SessionEntry {
    session: Session,
    last_activity: Instant,
    idle_timer: JoinHandle<()>,
}

type SessionTable = RwLock<HashMap<SessionId, SessionEntry>>;

/// Owns the session table; all mutation goes through its methods
pub struct SessionManager {
    sessions: Arc<SessionTable>,
    idle_timeout: Duration,
    events: EventBus,
    metrics: Option<Arc<ServerMetrics>>,
}

impl SessionManager {
    pub fn new(config: &SessionConfig, events: EventBus) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout: config.idle_timeout(),
            events,
            metrics: None,
        }
    }

    /// Report session open/close counts to the given metrics
    pub fn with_metrics(mut self, metrics: Arc<ServerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Allocate a new active session and start its idle timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_session(
        &self,
        client_info: ClientInfo,
        capabilities: serde_json::Value,
        protocol_version: impl Into<String>,
    ) -> Session {
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            client_info,
            capabilities,
            protocol_version: protocol_version.into(),
            state: SessionState::Active,
            created_at: now,
            last_activity_at: now,
            idle_timeout_ms: self.idle_timeout.as_millis() as u64,
            close_reason: None,
        };

        {
            // The timer task reads the table, so it cannot observe the
            // session before this write guard is released.
            let mut sessions = self.sessions.write();
            let idle_timer = tokio::spawn(watch_idle(
                Arc::downgrade(&self.sessions),
                session.id,
                self.idle_timeout,
                self.events.clone(),
                self.metrics.clone(),
            ));
            sessions.insert(
                session.id,
                SessionEntry {
                    session: session.clone(),
                    last_activity: Instant::now(),
                    idle_timer,
                },
            );
        }

        tracing::info!(
            session_id = %session.id,
            client = %session.client_info.name,
            "Session created"
        );
        if let Some(metrics) = &self.metrics {
            metrics.session_opened();
        }
        self.events.emit(EventType::SessionCreated {
            session_id: session.id,
            client_name: session.client_info.name.clone(),
        });

        session
    }

    /// Look up an active session
    pub fn get(&self, id: &SessionId) -> CoreResult<Session> {
        self.sessions
            .read()
            .get(id)
            .map(|entry| entry.session.clone())
            .ok_or(CoreError::SessionNotFound(*id))
    }

    /// Record activity, pushing the idle deadline out
    pub fn touch(&self, id: &SessionId) -> CoreResult<()> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(id)
            .ok_or(CoreError::SessionNotFound(*id))?;
        entry.last_activity = Instant::now();
        entry.session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Close a session. Returns the final record, or `None` when the id is
    /// unknown or already closed.
    pub fn close(&self, id: &SessionId, reason: CloseReason) -> Option<Session> {
        let entry = self.sessions.write().remove(id)?;
        entry.idle_timer.abort();

        let mut session = entry.session;
        session.state = SessionState::Closed;
        session.close_reason = Some(reason);

        tracing::info!(session_id = %session.id, reason = ?reason, "Session closed");
        if let Some(metrics) = &self.metrics {
            metrics.session_closed();
        }
        self.events.emit(EventType::SessionClosed {
            session_id: session.id,
            reason,
        });

        Some(session)
    }

    /// Close every open session, returning how many were closed
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.iter()
            .filter(|id| self.close(id, reason).is_some())
            .count()
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for entry in self.sessions.read().values() {
            entry.idle_timer.abort();
        }
    }
}

async fn watch_idle(
    sessions: Weak<SessionTable>,
    id: SessionId,
    idle_timeout: Duration,
    events: EventBus,
    metrics: Option<Arc<ServerMetrics>>,
) {
    loop {
        let deadline = {
            let Some(table) = sessions.upgrade() else { return };
            let guard = table.read();
            match guard.get(&id) {
                Some(entry) => entry.last_activity + idle_timeout,
                None => return,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let Some(table) = sessions.upgrade() else { return };
        let expired = {
            let mut guard = table.write();
            match guard.get(&id) {
                Some(entry) if Instant::now() >= entry.last_activity + idle_timeout => {
                    guard.remove(&id)
                }
                Some(_) => None,
                None => return,
            }
        };

        if expired.is_some() {
            tracing::info!(session_id = %id, "Session expired after idle timeout");
            if let Some(metrics) = &metrics {
                metrics.session_closed();
            }
            events.emit(EventType::SessionExpired { session_id: id });
            return;
        }
    }
}
