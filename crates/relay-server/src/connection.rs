//! Client connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_core::errors::RegistryError;
use relay_core::health::{ConnectionRole, ConnectionStatus};
use relay_core::ids::{ConnectionId, ThreadId, UserId};
use serde::Serialize;
use tokio::sync::watch;

/// What the host supplies when a client finishes authentication.
#[derive(Clone, Debug)]
pub struct ConnectionRegistration {
    /// Connection ID chosen by the host.
    pub connection_id: ConnectionId,
    /// Authenticated owner. Never changes after registration.
    pub user_id: UserId,
    /// Primary or standby.
    pub role: ConnectionRole,
    /// Threads to receive. Empty means every thread of the owner.
    pub thread_ids: Vec<ThreadId>,
}

impl ConnectionRegistration {
    /// Primary connection subscribed to all of the user's threads.
    pub fn primary(connection_id: impl Into<ConnectionId>, user_id: impl Into<UserId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            role: ConnectionRole::Primary,
            thread_ids: Vec::new(),
        }
    }

    /// Backup connection subscribed to all of the user's threads.
    pub fn backup(connection_id: impl Into<ConnectionId>, user_id: impl Into<UserId>) -> Self {
        Self {
            role: ConnectionRole::Backup,
            ..Self::primary(connection_id, user_id)
        }
    }

    /// Restrict the subscription to the given threads.
    #[must_use]
    pub fn with_threads(mut self, thread_ids: impl IntoIterator<Item = ThreadId>) -> Self {
        self.thread_ids = thread_ids.into_iter().collect();
        self
    }
}

/// Delivery and liveness counters of one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthMetrics {
    /// Events sent successfully.
    pub events_delivered: u64,
    /// Sends that failed after retries.
    pub delivery_failures: u64,
    /// Consecutive heartbeat checks without a pong.
    pub missed_heartbeats: u32,
}

/// Serializable view of a connection.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Owner.
    pub user_id: UserId,
    /// Role.
    pub role: ConnectionRole,
    /// Subscribed threads (empty = all).
    pub thread_ids: Vec<ThreadId>,
    /// Current status.
    pub status: ConnectionStatus,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the last pong or delivery.
    pub idle_ms: u64,
    /// Counters.
    pub health_metrics: HealthMetrics,
}

/// A registered client connection.
///
/// Owner and role are fixed at construction. Status changes go through
/// [`transition`](Self::transition), which enforces the health state machine.
pub struct ClientConnection {
    id: ConnectionId,
    user_id: UserId,
    role: ConnectionRole,
    thread_ids: RwLock<HashSet<ThreadId>>,
    status: watch::Sender<ConnectionStatus>,
    created_at: DateTime<Utc>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
    /// Whether the client has responded since the last heartbeat check.
    is_alive: AtomicBool,
    delivered: AtomicU64,
    failures: AtomicU64,
    missed_heartbeats: AtomicU32,
}

impl ClientConnection {
    /// Create a connection in the `connecting` state.
    pub fn new(registration: ConnectionRegistration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let now = Instant::now();
        Self {
            id: registration.connection_id,
            user_id: registration.user_id,
            role: registration.role,
            thread_ids: RwLock::new(registration.thread_ids.into_iter().collect()),
            status,
            created_at: Utc::now(),
            connected_at: now,
            last_activity: Mutex::new(now),
            is_alive: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            missed_heartbeats: AtomicU32::new(0),
        }
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owner asserted at registration.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Role.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Whether this is a standby connection.
    pub fn is_backup(&self) -> bool {
        self.role == ConnectionRole::Backup
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Whether events may be sent now.
    pub fn is_deliverable(&self) -> bool {
        self.status().is_deliverable()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Move to `next`. Returns the previous status when it changed, `None`
    /// when `next` equals the current status.
    pub fn transition(
        &self,
        next: ConnectionStatus,
    ) -> Result<Option<ConnectionStatus>, RegistryError> {
        let mut outcome = Ok(None);
        let _ = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                outcome = Err(RegistryError::InvalidTransition {
                    connection_id: self.id.clone(),
                    from: *current,
                    to: next,
                });
                return false;
            }
            outcome = Ok(Some(*current));
            *current = next;
            true
        });
        outcome
    }

    /// Subscribe to a thread.
    pub fn bind_thread(&self, thread_id: ThreadId) {
        let _ = self.thread_ids.write().insert(thread_id);
    }

    /// Whether events of `thread_id` go to this connection.
    pub fn is_subscribed(&self, thread_id: &ThreadId) -> bool {
        let threads = self.thread_ids.read();
        threads.is_empty() || threads.contains(thread_id)
    }

    /// Subscribed threads, sorted. Empty means all.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        let mut ids: Vec<_> = self.thread_ids.read().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Mark the connection as alive (pong or other client activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last pong, delivery, or registration.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Registration time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn record_delivery(&self) {
        let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn record_failure(&self) {
        let _ = self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_missed_heartbeats(&self, missed: u32) {
        self.missed_heartbeats.store(missed, Ordering::Relaxed);
    }

    /// Counters.
    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMetrics {
            events_delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.failures.load(Ordering::Relaxed),
            missed_heartbeats: self.missed_heartbeats.load(Ordering::Relaxed),
        }
    }

    /// Serializable view.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: self.id.clone(),
            user_id: self.user_id.clone(),
            role: self.role,
            thread_ids: self.thread_ids(),
            status: self.status(),
            created_at: self.created_at,
            idle_ms: self.idle_for().as_millis() as u64,
            health_metrics: self.health_metrics(),
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_connection() -> ClientConnection {
        ClientConnection::new(ConnectionRegistration::primary("conn_1", "alice"))
    }

    #[test]
    fn create_connection() {
        let conn = make_connection();
        assert_eq!(conn.id().as_str(), "conn_1");
        assert_eq!(conn.user_id().as_str(), "alice");
        assert_eq!(conn.role(), ConnectionRole::Primary);
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
        assert!(!conn.is_deliverable());
    }

    #[test]
    fn backup_registration() {
        let conn = ClientConnection::new(ConnectionRegistration::backup("c2", "alice"));
        assert!(conn.is_backup());
    }

    #[test]
    fn transition_returns_previous() {
        let conn = make_connection();
        assert_eq!(
            conn.transition(ConnectionStatus::Active).unwrap(),
            Some(ConnectionStatus::Connecting)
        );
        assert!(conn.is_deliverable());
        // Same status again is a no-op.
        assert_eq!(conn.transition(ConnectionStatus::Active).unwrap(), None);
    }

    #[test]
    fn invalid_transition_rejected() {
        let conn = make_connection();
        assert_matches!(
            conn.transition(ConnectionStatus::Degraded),
            Err(RegistryError::InvalidTransition { from: ConnectionStatus::Connecting, .. })
        );
        let _ = conn.transition(ConnectionStatus::Terminated).unwrap();
        assert_matches!(
            conn.transition(ConnectionStatus::Active),
            Err(RegistryError::InvalidTransition { .. })
        );
        assert_eq!(conn.status(), ConnectionStatus::Terminated);
    }

    #[tokio::test]
    async fn status_watchers_see_changes() {
        let conn = make_connection();
        let mut rx = conn.subscribe_status();
        let _ = conn.transition(ConnectionStatus::Active).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionStatus::Active);
    }

    #[test]
    fn thread_subscription() {
        let conn = make_connection();
        assert!(conn.is_subscribed(&ThreadId::from("any")));
        conn.bind_thread(ThreadId::from("t2"));
        conn.bind_thread(ThreadId::from("t1"));
        assert!(conn.is_subscribed(&ThreadId::from("t1")));
        assert!(!conn.is_subscribed(&ThreadId::from("t3")));
        assert_eq!(conn.thread_ids(), vec![ThreadId::from("t1"), ThreadId::from("t2")]);
    }

    #[test]
    fn mark_alive_and_check() {
        let conn = make_connection();
        // Initially alive
        assert!(conn.check_alive());
        // After check, no longer alive
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn counters_show_in_snapshot() {
        let conn = ClientConnection::new(
            ConnectionRegistration::primary("c1", "alice").with_threads([ThreadId::from("t1")]),
        );
        conn.record_delivery();
        conn.record_delivery();
        conn.record_failure();
        conn.set_missed_heartbeats(2);
        let snap = conn.snapshot();
        assert_eq!(snap.health_metrics.events_delivered, 2);
        assert_eq!(snap.health_metrics.delivery_failures, 1);
        assert_eq!(snap.health_metrics.missed_heartbeats, 2);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "connecting");
        assert_eq!(json["role"], "primary");
        assert_eq!(json["thread_ids"][0], "t1");
    }

    #[test]
    fn connection_age_increases() {
        let conn = make_connection();
        let age1 = conn.age();
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.age() > age1);
    }
}
