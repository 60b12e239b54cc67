//! Bounded pool of reusable outbound connections.
//!
//! The pool never holds more than `max_size` connections, counting idle,
//! checked-out and in-flight connects. When it is full, `acquire` joins a
//! FIFO queue; each release hands its connection (or, for an evicted
//! connection, its freed capacity) to the oldest live waiter, so a waiter can
//! only be overtaken by callers that arrived before it.
//!
//! Every slot is tied to a guard. A lent connection, an in-flight connect or
//! a queued acquire that is dropped without finishing (for example when its
//! task is aborted) hands its slot back instead of leaking it.

use crate::config::PoolConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::ConnectionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Creates, probes and closes the connections a pool manages
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    /// Open a new connection
    async fn connect(&self) -> CoreResult<Self::Connection>;

    /// Probe a connection being returned to the pool
    async fn is_healthy(&self, connection: &Self::Connection) -> bool;

    /// Tear down a connection leaving the pool
    async fn close(&self, connection: Self::Connection);
}

/// Pooled connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Closed,
}

type Reclaim = Box<dyn FnOnce() + Send + Sync>;

/// Gives a slot back to the pool when dropped, unless disarmed first
struct SlotGuard {
    reclaim: Option<Reclaim>,
}

impl SlotGuard {
    fn new(reclaim: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            reclaim: Some(Box::new(reclaim)),
        }
    }

    fn disarm(mut self) {
        self.reclaim = None;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(reclaim) = self.reclaim.take() {
            reclaim();
        }
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("armed", &self.reclaim.is_some())
            .finish()
    }
}

/// A connection owned by the pool and lent out by `acquire`.
///
/// Dropping a lent connection instead of passing it to `release` or
/// `discard` frees its slot; the connection itself is dropped, not closed.
#[derive(Debug)]
pub struct PooledConnection<T> {
    id: ConnectionId,
    connection: T,
    state: ConnectionState,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    idle_since: Instant,
    lease: Option<SlotGuard>,
}

impl<T> PooledConnection<T> {
    fn new(connection: T) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            connection,
            state: ConnectionState::Active,
            created_at: now,
            last_used_at: now,
            idle_since: Instant::now(),
            lease: None,
        }
    }

    fn end_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.disarm();
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connection(&self) -> &T {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }
}

impl<T> std::ops::Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.connection
    }
}

/// Pool occupancy counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub max_size: usize,
    pub created: u64,
    pub evicted: u64,
}

/// What a queued waiter is handed
enum Grant<T> {
    /// A released, healthy connection, already counted as active
    Connection(PooledConnection<T>),
    /// A free slot, already counted as connecting
    Capacity,
}

struct PoolState<T> {
    idle: VecDeque<PooledConnection<T>>,
    active: usize,
    connecting: usize,
    waiters: VecDeque<oneshot::Sender<Grant<T>>>,
    closed: bool,
    created: u64,
    evicted: u64,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.connecting
    }

    fn take_expired(&mut self, ttl: std::time::Duration) -> Vec<PooledConnection<T>> {
        let now = Instant::now();
        let (expired, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.idle)
            .into_iter()
            .partition(|conn| now.duration_since(conn.idle_since) >= ttl);
        self.idle = fresh;
        self.evicted += expired.len() as u64;
        expired.into_iter().collect()
    }

    /// Offer a grant to waiters in arrival order, skipping any that gave up.
    /// Returns the grant if nobody took it.
    fn offer(&mut self, mut grant: Grant<T>) -> Option<Grant<T>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Hand freed capacity to the oldest waiter, if any
    fn offer_capacity(&mut self) {
        if self.closed || self.waiters.is_empty() {
            return;
        }
        self.connecting += 1;
        if self.offer(Grant::Capacity).is_some() {
            self.connecting -= 1;
        }
    }

    /// Take back a checked-out connection: it goes to the oldest waiter or
    /// the idle set. Returns it when the pool is closed and it must be closed.
    fn return_connection(&mut self, mut conn: PooledConnection<T>) -> Option<PooledConnection<T>> {
        if self.closed {
            self.active -= 1;
            return Some(conn);
        }

        conn.state = ConnectionState::Active;
        if let Some(Grant::Connection(mut conn)) = self.offer(Grant::Connection(conn)) {
            self.active -= 1;
            conn.state = ConnectionState::Idle;
            self.idle.push_back(conn);
        }
        None
    }

    /// Put back a grant that reached a waiter which gave up before taking it
    fn restore(&mut self, grant: Grant<T>) {
        match grant {
            Grant::Connection(conn) => {
                if let Some(conn) = self.return_connection(conn) {
                    tracing::debug!(connection_id = %conn.id, "Dropping connection returned to a closed pool");
                }
            }
            Grant::Capacity => {
                self.connecting -= 1;
                self.offer_capacity();
            }
        }
    }
}

/// A queued acquire. A grant that arrives after the caller stopped waiting
/// is put back when this is dropped.
struct PendingGrant<T> {
    rx: oneshot::Receiver<Grant<T>>,
    state: Weak<Mutex<PoolState<T>>>,
}

impl<T> Drop for PendingGrant<T> {
    fn drop(&mut self) {
        self.rx.close();
        let Ok(grant) = self.rx.try_recv() else {
            return;
        };
        if let Some(state) = self.state.upgrade() {
            state.lock().restore(grant);
        }
    }
}

enum Checkout<T> {
    Ready(PooledConnection<T>),
    Create(SlotGuard),
    Wait(PendingGrant<T>),
}

/// Bounded, FIFO-fair connection pool
pub struct ConnectionPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Arc<Mutex<PoolState<C::Connection>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                connecting: 0,
                waiters: VecDeque::new(),
                closed: false,
                created: 0,
                evicted: 0,
            })),
        }
    }

    /// Guard for a checked-out connection's slot
    fn lease(&self) -> SlotGuard {
        let state = Arc::downgrade(&self.state);
        SlotGuard::new(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            state.active -= 1;
            state.evicted += 1;
            state.offer_capacity();
            tracing::warn!("Pooled connection dropped without release, freeing its slot");
        })
    }

    /// Guard for a slot counted as connecting
    fn connecting_slot(&self) -> SlotGuard {
        let state = Arc::downgrade(&self.state);
        SlotGuard::new(move || {
            if let Some(state) = state.upgrade() {
                let mut state = state.lock();
                state.connecting -= 1;
                state.offer_capacity();
            }
        })
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, creating one if below capacity, otherwise
    /// queueing until a release or the acquire timeout.
    pub async fn acquire(&self) -> CoreResult<PooledConnection<C::Connection>> {
        let started = Instant::now();

        let (checkout, expired) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(CoreError::PoolClosed);
            }

            let expired = state.take_expired(self.config.idle_ttl());
            let checkout = if let Some(mut conn) = state.idle.pop_back() {
                conn.state = ConnectionState::Active;
                conn.lease = Some(self.lease());
                state.active += 1;
                Checkout::Ready(conn)
            } else if state.total() < self.config.max_size {
                state.connecting += 1;
                Checkout::Create(self.connecting_slot())
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Checkout::Wait(PendingGrant {
                    rx,
                    state: Arc::downgrade(&self.state),
                })
            };
            (checkout, expired)
        };

        for conn in expired {
            tracing::debug!(connection_id = %conn.id, "Evicting idle connection past TTL");
            self.connector.close(conn.connection).await;
        }

        let mut conn = match checkout {
            Checkout::Ready(conn) => conn,
            Checkout::Create(slot) => self.open(slot).await?,
            Checkout::Wait(mut pending) => {
                let grant = match tokio::time::timeout(self.config.acquire_timeout(), &mut pending.rx)
                    .await
                {
                    Ok(Ok(grant)) => grant,
                    Ok(Err(_)) => return Err(CoreError::PoolClosed),
                    Err(_) => {
                        // A grant may have landed between the deadline and now.
                        pending.rx.close();
                        match pending.rx.try_recv() {
                            Ok(grant) => grant,
                            Err(_) => {
                                let waited_ms = started.elapsed().as_millis() as u64;
                                tracing::warn!(
                                    waited_ms,
                                    max_size = self.config.max_size,
                                    "Connection pool exhausted"
                                );
                                return Err(CoreError::PoolExhausted {
                                    waited_ms,
                                    max_size: self.config.max_size,
                                });
                            }
                        }
                    }
                };
                match grant {
                    Grant::Connection(mut conn) => {
                        conn.lease = Some(self.lease());
                        conn
                    }
                    Grant::Capacity => self.open(self.connecting_slot()).await?,
                }
            }
        };

        conn.last_used_at = Utc::now();
        Ok(conn)
    }

    /// Open a connection for a slot already counted as connecting. The slot
    /// is handed on if the connect fails or is cancelled.
    async fn open(&self, slot: SlotGuard) -> CoreResult<PooledConnection<C::Connection>> {
        match self.connector.connect().await {
            Ok(connection) => {
                slot.disarm();
                let mut conn = PooledConnection::new(connection);
                {
                    let mut state = self.state.lock();
                    state.connecting -= 1;
                    state.active += 1;
                    state.created += 1;
                }
                conn.lease = Some(self.lease());
                tracing::debug!(connection_id = %conn.id, "Opened pooled connection");
                Ok(conn)
            }
            Err(e) => {
                drop(slot);
                tracing::warn!(error = %e, "Failed to open pooled connection");
                Err(e)
            }
        }
    }

    /// Return a connection. Healthy connections go to the oldest waiter or
    /// back to the idle set; unhealthy ones are closed.
    pub async fn release(&self, mut conn: PooledConnection<C::Connection>) {
        if !self.connector.is_healthy(&conn.connection).await {
            tracing::debug!(connection_id = %conn.id, "Evicting unhealthy connection on release");
            self.evict(conn).await;
            return;
        }

        conn.end_lease();
        conn.last_used_at = Utc::now();
        conn.idle_since = Instant::now();
        let to_close = self.state.lock().return_connection(conn);

        if let Some(conn) = to_close {
            self.connector.close(conn.connection).await;
        }
    }

    /// Close a connection the caller knows has failed
    pub async fn discard(&self, conn: PooledConnection<C::Connection>) {
        tracing::debug!(connection_id = %conn.id, "Discarding failed connection");
        self.evict(conn).await;
    }

    async fn evict(&self, mut conn: PooledConnection<C::Connection>) {
        conn.end_lease();
        {
            let mut state = self.state.lock();
            state.active -= 1;
            state.evicted += 1;
            state.offer_capacity();
        }
        conn.state = ConnectionState::Closed;
        self.connector.close(conn.connection).await;
    }

    /// Close idle connections past their TTL, returning how many were evicted
    pub async fn evict_expired(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let expired = state.take_expired(self.config.idle_ttl());
            for _ in 0..expired.len() {
                state.offer_capacity();
            }
            expired
        };

        let count = expired.len();
        for conn in expired {
            self.connector.close(conn.connection).await;
        }
        count
    }

    /// Close the pool: idle connections are closed, queued and future
    /// acquires fail with `PoolClosed`. Checked-out connections are closed
    /// when released.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiters.clear();
            std::mem::take(&mut state.idle)
        };

        tracing::debug!(idle = idle.len(), "Closing connection pool");
        for conn in idle {
            self.connector.close(conn.connection).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            connecting: state.connecting,
            waiting: state.waiters.len(),
            max_size: self.config.max_size,
            created: state.created,
            evicted: state.evicted,
        }
    }
}
