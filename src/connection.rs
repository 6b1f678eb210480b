//! # Connection Manager
//!
//! Owns at most one live session per host and serializes every command sent
//! to that host.
//!
//! ## Model
//!
//! Each host has an entry holding a `tokio::sync::Mutex` around its session
//! slot. [`ConnectionManager::acquire`] queues on that mutex and hands back a
//! [`ConnectionGuard`]; the guard *is* the critical section, and dropping it
//! releases the host to the next waiter. Tokio's mutex grants the lock in
//! arrival order, so waiters are served FIFO and nobody starves. Hosts never
//! share a lock, so operations against different hosts run fully in
//! parallel.
//!
//! ```text
//!            ┌──────────────┐ first use ┌────────────┐ handshake ok ┌───────────┐
//!            │ Disconnected │──────────▶│ Connecting │─────────────▶│ Connected │
//!            └──────────────┘           └────────────┘              └─────┬─────┘
//!                                           ▲     │ handshake failed      │ transport error
//!                                 next use  │     ▼                       ▼
//!                                           │ ┌────────┐◀────────────────────┘
//!                                           └─│ Broken │
//!                                             └────────┘
//! ```
//!
//! A command abandoned mid-flight (timeout or caller cancellation) does not
//! break the connection outright; it marks it for a health check that runs
//! on the next acquire before anything else is sent.

use crate::host::{Host, HostId};
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of the connection to one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Broken,
}

/// Why a connection could not be handed out.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquireError {
    /// The caller's deadline passed while queued or handshaking
    #[error("Deadline exceeded while waiting for a connection to {0}")]
    DeadlineExceeded(HostId),

    /// Connecting failed permanently or ran out of attempts
    #[error("Host {host} unreachable after {attempts} connection attempt(s): {error}")]
    HostUnreachable {
        host: HostId,
        error: TransportError,
        attempts: u32,
    },
}

/// Timeouts and retry settings used when (re)connecting.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub health_check_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        use crate::env::defaults;
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(defaults::CONNECT_TIMEOUT_SECS),
            health_check_timeout: Duration::from_secs(defaults::HEALTH_CHECK_TIMEOUT_SECS),
        }
    }
}

/// Point-in-time view of one host's connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostConnectionStatus {
    pub host: HostId,
    pub state: ConnectionState,
    pub handshakes: u64,
    pub connected_since: Option<DateTime<Utc>>,
}

struct Slot<S> {
    session: Option<S>,
    needs_health_check: bool,
}

struct HostEntry<S> {
    host: Host,
    slot: Arc<Mutex<Slot<S>>>,
    state: watch::Sender<ConnectionState>,
    /// Readable without waiting for the host's critical section
    connected_since: watch::Sender<Option<DateTime<Utc>>>,
    handshakes: AtomicU64,
}

impl<S> HostEntry<S> {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection to {}: {:?} -> {:?}", self.host, previous, state);
        }
    }
}

/// Per-host connection owner.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    settings: ConnectionSettings,
    hosts: DashMap<HostId, Arc<HostEntry<T::Session>>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, settings: ConnectionSettings) -> Self {
        Self {
            transport,
            settings,
            hosts: DashMap::new(),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn entry(&self, host: &Host) -> Arc<HostEntry<T::Session>> {
        let entry = self
            .hosts
            .entry(host.id().clone())
            .or_insert_with(|| {
                Arc::new(HostEntry {
                    host: host.clone(),
                    slot: Arc::new(Mutex::new(Slot {
                        session: None,
                        needs_health_check: false,
                    })),
                    state: watch::Sender::new(ConnectionState::Disconnected),
                    connected_since: watch::Sender::new(None),
                    handshakes: AtomicU64::new(0),
                })
            });
        Arc::clone(entry.value())
    }

    /// Wait for exclusive use of `host`'s connection, connecting if needed.
    ///
    /// Waiters are served in arrival order. `deadline` bounds both the queue
    /// wait and the handshake.
    ///
    /// # Errors
    ///
    /// [`AcquireError::DeadlineExceeded`] if the deadline passes first,
    /// [`AcquireError::HostUnreachable`] once reconnect attempts are
    /// exhausted or a permanent failure (e.g. authentication) occurs.
    pub async fn acquire(
        &self,
        host: &Host,
        deadline: Option<Instant>,
    ) -> Result<ConnectionGuard<T>, AcquireError> {
        let entry = self.entry(host);
        let transport = Arc::clone(&self.transport);
        let settings = self.settings.clone();

        let acquire = async move {
            let slot = Arc::clone(&entry.slot).lock_owned().await;
            let mut guard = ConnectionGuard {
                entry,
                slot,
                transport,
                settings,
                in_flight: false,
            };
            guard.ensure_connected().await?;
            Ok::<_, AcquireError>(guard)
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire)
                .await
                .map_err(|_| AcquireError::DeadlineExceeded(host.id().clone()))?,
            None => acquire.await,
        }
    }

    /// Give a connection back. Equivalent to dropping the guard.
    pub fn release(&self, guard: ConnectionGuard<T>) {
        drop(guard);
    }

    /// Mark `host`'s connection broken from outside an operation.
    ///
    /// Waits for the host's critical section like any other user.
    pub async fn invalidate(&self, host: &Host) {
        let entry = self.entry(host);
        let slot = Arc::clone(&entry.slot).lock_owned().await;
        let mut guard = ConnectionGuard {
            entry,
            slot,
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            in_flight: false,
        };
        guard.invalidate().await;
    }

    pub fn state(&self, host: &HostId) -> Option<ConnectionState> {
        self.hosts.get(host).map(|entry| *entry.state.borrow())
    }

    /// Watch state transitions of a host's connection.
    pub fn subscribe(&self, host: &Host) -> watch::Receiver<ConnectionState> {
        self.entry(host).state.subscribe()
    }

    pub fn status(&self) -> Vec<HostConnectionStatus> {
        let mut status: Vec<_> = self
            .hosts
            .iter()
            .map(|entry| HostConnectionStatus {
                host: entry.key().clone(),
                state: *entry.state.borrow(),
                handshakes: entry.handshakes.load(Ordering::Relaxed),
                connected_since: *entry.connected_since.borrow(),
            })
            .collect();
        status.sort_by(|a, b| a.host.cmp(&b.host));
        status
    }

    /// Close every session. Waits for in-progress operations to finish.
    pub async fn disconnect_all(&self) {
        let entries: Vec<_> = self.hosts.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let mut slot = entry.slot.lock().await;
            if let Some(session) = slot.session.take() {
                self.transport.disconnect(session).await;
            }
            slot.needs_health_check = false;
            entry.connected_since.send_replace(None);
            entry.set_state(ConnectionState::Disconnected);
        }
        info!("Closed all host connections");
    }
}

/// Exclusive use of one host's connection.
///
/// Holding the guard is holding the host's critical section. Dropping it
/// while a command is in flight marks the connection for a health check.
pub struct ConnectionGuard<T: Transport> {
    entry: Arc<HostEntry<T::Session>>,
    slot: OwnedMutexGuard<Slot<T::Session>>,
    transport: Arc<T>,
    settings: ConnectionSettings,
    in_flight: bool,
}

impl<T: Transport> ConnectionGuard<T> {
    pub fn host(&self) -> &Host {
        &self.entry.host
    }

    pub fn state(&self) -> ConnectionState {
        *self.entry.state.borrow()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Live session, if connected.
    pub fn session(&self) -> Option<&T::Session> {
        match self.state() {
            ConnectionState::Connected => self.slot.session.as_ref(),
            _ => None,
        }
    }

    pub fn needs_health_check(&self) -> bool {
        self.slot.needs_health_check
    }

    pub(crate) fn begin_dispatch(&mut self) {
        self.in_flight = true;
    }

    pub(crate) fn end_dispatch(&mut self) {
        self.in_flight = false;
    }

    /// Ask for a liveness probe before the next command.
    pub fn mark_for_health_check(&mut self) {
        self.slot.needs_health_check = true;
    }

    /// Drop the session and mark the connection broken.
    pub async fn invalidate(&mut self) {
        if let Some(session) = self.slot.session.take() {
            warn!("Invalidating connection to {}", self.entry.host);
            self.transport.disconnect(session).await;
        }
        self.slot.needs_health_check = false;
        self.entry.connected_since.send_replace(None);
        if self.state() != ConnectionState::Disconnected {
            self.entry.set_state(ConnectionState::Broken);
        }
    }

    /// Make sure a healthy session exists, reconnecting with the retry policy.
    pub async fn ensure_connected(&mut self) -> Result<(), AcquireError> {
        if self.slot.session.is_some() && self.slot.needs_health_check {
            self.probe().await;
        }

        if self.slot.session.is_some() && self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.connect().await
    }

    async fn probe(&mut self) {
        let Some(session) = self.slot.session.as_ref() else {
            return;
        };
        debug!("Health-checking connection to {}", self.entry.host);

        let result = tokio::time::timeout(
            self.settings.health_check_timeout,
            self.transport.health_check(session),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(self.settings.health_check_timeout)));

        match result {
            Ok(()) => {
                self.slot.needs_health_check = false;
            }
            Err(e) => {
                warn!("Health check for {} failed: {}", self.entry.host, e);
                self.invalidate().await;
            }
        }
    }

    async fn connect(&mut self) -> Result<(), AcquireError> {
        let host = self.entry.host.clone();
        let transport = Arc::clone(&self.transport);
        let connect_timeout = self.settings.connect_timeout;

        self.entry.set_state(ConnectionState::Connecting);

        let result = self
            .settings
            .retry
            .run(TransportError::class, |attempt| {
                let host = &host;
                let transport = &transport;
                self.entry.handshakes.fetch_add(1, Ordering::Relaxed);
                async move {
                    debug!("Connecting to {} (attempt {})", host, attempt);
                    tokio::time::timeout(connect_timeout, transport.connect(host))
                        .await
                        .unwrap_or(Err(TransportError::Timeout(connect_timeout)))
                }
            })
            .await;

        match result {
            Ok(connected) => {
                if connected.attempts > 1 {
                    info!(
                        "Connected to {} after {} attempts",
                        host, connected.attempts
                    );
                }
                self.slot.session = Some(connected.value);
                self.slot.needs_health_check = false;
                self.entry.connected_since.send_replace(Some(Utc::now()));
                self.entry.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.entry.set_state(ConnectionState::Broken);
                let attempts = err.attempts();
                let error = match err {
                    RetryError::Permanent { error, .. } | RetryError::Exhausted { error, .. } => {
                        error
                    }
                };
                warn!(
                    "Giving up on {} after {} connection attempt(s): {}",
                    host, attempts, error
                );
                Err(AcquireError::HostUnreachable {
                    host: host.id().clone(),
                    error,
                    attempts,
                })
            }
        }
    }
}

impl<T: Transport> Drop for ConnectionGuard<T> {
    fn drop(&mut self) {
        if self.state() == ConnectionState::Connecting {
            // Handshake cancelled (caller's deadline); no session was stored.
            self.entry.set_state(ConnectionState::Broken);
        }
        if self.in_flight {
            // The response to whatever was sent is lost; probe before reuse.
            warn!(
                "Command to {} abandoned mid-flight, connection needs a health check",
                self.entry.host
            );
            self.slot.needs_health_check = true;
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("host", &self.entry.host.id())
            .field("state", &self.state())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
