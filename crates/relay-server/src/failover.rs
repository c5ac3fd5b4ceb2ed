//! Failover coordination and offline buffering.
//!
//! The coordinator observes registry health transitions. When a primary
//! becomes `disconnected` it picks a deliverable backup of the same user and
//! records a [`FailoverRecord`]; while the record is open the router sends
//! the primary's share of events to the backup. When the primary returns to
//! `active` the record closes and routing reverts. Events already delivered
//! to the backup are not replayed.
//!
//! Without a usable backup the user is marked offline and undeliverable
//! events go to the [`OfflineBuffer`] (or are dropped, per policy).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use relay_core::errors::DeliveryError;
use relay_core::events::Event;
use relay_core::health::{ConnectionRole, ConnectionStatus};
use relay_core::ids::{ConnectionId, ThreadId, UserId};
use relay_core::telemetry::{self, MetricsSink};
use relay_settings::{EngineOptions, OfflinePolicy};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::registry::{ConnectionRegistry, HealthObserver};

/// One primary-to-backup redirection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailoverRecord {
    /// Owner of both connections.
    pub user_id: UserId,
    /// Connection that failed.
    pub primary_connection_id: ConnectionId,
    /// Connection receiving the primary's events.
    pub backup_connection_id: ConnectionId,
    /// When the primary was marked disconnected.
    pub failed_at: DateTime<Utc>,
    /// When the primary came back. `None` while open, or if the primary was
    /// unregistered instead.
    pub recovered_at: Option<DateTime<Utc>>,
}

/// What happened to an event handed to the offline buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Held for later delivery.
    Buffered,
    /// Held, and the oldest held event was discarded to make room.
    Evicted,
    /// Discarded.
    Dropped,
}

/// Bounded per-user holding area for events that had nowhere to go.
#[derive(Debug)]
pub struct OfflineBuffer {
    policy: OfflinePolicy,
    capacity: usize,
    window: Duration,
    queues: Mutex<HashMap<UserId, VecDeque<(Instant, Arc<Event>)>>>,
}

impl OfflineBuffer {
    /// Create a buffer.
    pub fn new(policy: OfflinePolicy, capacity: usize, window: Duration) -> Self {
        Self {
            policy,
            capacity,
            window,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Hold an event for its owner. Also returns how many of the owner's
    /// held events expired and were discarded on the way.
    pub fn push(&self, event: Arc<Event>) -> (BufferOutcome, usize) {
        if self.policy == OfflinePolicy::Drop || self.capacity == 0 {
            return (BufferOutcome::Dropped, 0);
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(event.user_id().clone()).or_default();
        let now = Instant::now();
        let expired = Self::expire(queue, now, self.window);
        let outcome = if queue.len() >= self.capacity {
            let _ = queue.pop_front();
            BufferOutcome::Evicted
        } else {
            BufferOutcome::Buffered
        };
        queue.push_back((now, event));
        (outcome, expired)
    }

    /// Take the held events of one of the user's threads, oldest first.
    /// Events of other threads stay held. Returns the live events and how
    /// many of the user's events expired.
    pub fn drain_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> (Vec<Arc<Event>>, usize) {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(user_id) else {
            return (Vec::new(), 0);
        };
        let expired = Self::expire(queue, Instant::now(), self.window);
        let mut taken = Vec::new();
        queue.retain(|(_, event)| {
            if event.thread_id() == thread_id {
                taken.push(Arc::clone(event));
                false
            } else {
                true
            }
        });
        if queue.is_empty() {
            let _ = queues.remove(user_id);
        }
        (taken, expired)
    }

    /// Threads of the user with held events, in order of their oldest event.
    pub fn pending_threads(&self, user_id: &UserId) -> Vec<ThreadId> {
        let queues = self.queues.lock();
        let mut threads: Vec<ThreadId> = Vec::new();
        for (_, event) in queues.get(user_id).into_iter().flatten() {
            if !threads.contains(event.thread_id()) {
                threads.push(event.thread_id().clone());
            }
        }
        threads
    }

    /// Whether anything is held for the user.
    pub fn has_pending(&self, user_id: &UserId) -> bool {
        self.queues.lock().get(user_id).is_some_and(|q| !q.is_empty())
    }

    /// Whether anything is held for one of the user's threads.
    pub fn has_pending_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> bool {
        self.queues
            .lock()
            .get(user_id)
            .is_some_and(|q| q.iter().any(|(_, e)| e.thread_id() == thread_id))
    }

    /// Number of events held for the user.
    pub fn pending(&self, user_id: &UserId) -> usize {
        self.queues.lock().get(user_id).map_or(0, VecDeque::len)
    }

    fn expire(queue: &mut VecDeque<(Instant, Arc<Event>)>, now: Instant, window: Duration) -> usize {
        let mut expired = 0;
        while queue
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > window)
        {
            let _ = queue.pop_front();
            expired += 1;
        }
        expired
    }
}

/// Redirects delivery from failed primaries to healthy backups.
pub struct FailoverCoordinator {
    registry: Arc<ConnectionRegistry>,
    enabled: bool,
    /// Open records keyed by primary connection.
    active: DashMap<ConnectionId, FailoverRecord>,
    history: DashMap<UserId, Vec<FailoverRecord>>,
    offline: DashSet<UserId>,
    buffer: OfflineBuffer,
    metrics: Arc<dyn MetricsSink>,
}

impl FailoverCoordinator {
    /// Create a coordinator over `registry`. The caller registers it as a
    /// health observer.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        options: &EngineOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            enabled: options.failover_enabled,
            active: DashMap::new(),
            history: DashMap::new(),
            offline: DashSet::new(),
            buffer: OfflineBuffer::new(
                options.offline_policy,
                options.offline_buffer_capacity,
                options.offline_buffer_window(),
            ),
            metrics,
        }
    }

    /// The backup currently standing in for `primary`, if it can receive.
    pub fn backup_for(&self, primary: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let backup_id = self.active.get(primary)?.backup_connection_id.clone();
        self.registry.get(&backup_id).filter(|b| b.is_deliverable())
    }

    /// Open record for `primary`.
    pub fn active_failover(&self, primary: &ConnectionId) -> Option<FailoverRecord> {
        self.active.get(primary).map(|r| r.value().clone())
    }

    /// Closed records of the user, oldest first.
    pub fn failover_history(&self, user_id: &UserId) -> Vec<FailoverRecord> {
        self.history
            .get(user_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Whether the user has no deliverable connection and no backup.
    pub fn is_offline(&self, user_id: &UserId) -> bool {
        self.offline.contains(user_id)
    }

    /// The offline buffer.
    pub fn buffer(&self) -> &OfflineBuffer {
        &self.buffer
    }

    /// Hold (or drop) an undeliverable event and refresh the owner's
    /// offline flag.
    pub fn hold(&self, event: Arc<Event>) -> BufferOutcome {
        let user_id = event.user_id().clone();
        self.refresh_offline(&user_id);
        let tags = [("user_id", user_id.to_string())];
        let (outcome, expired) = self.buffer.push(event);
        if expired > 0 {
            self.metrics.record_metric(telemetry::EVENTS_DROPPED, expired as f64, &tags);
            warn!(%user_id, expired, "held events expired");
        }
        match outcome {
            BufferOutcome::Buffered => self.metrics.increment(telemetry::EVENTS_BUFFERED, &tags),
            BufferOutcome::Evicted => {
                self.metrics.increment(telemetry::EVENTS_BUFFERED, &tags);
                self.metrics.increment(telemetry::EVENTS_DROPPED, &tags);
            }
            BufferOutcome::Dropped => self.metrics.increment(telemetry::EVENTS_DROPPED, &tags),
        }
        debug!(%user_id, ?outcome, "event held for offline user");
        outcome
    }

    /// Escalate a delivery failure: mark the connection disconnected and
    /// return the connection that should take the in-flight event.
    pub fn report_failure(
        &self,
        connection: &Arc<ClientConnection>,
        error: &DeliveryError,
    ) -> Option<Arc<ClientConnection>> {
        connection.record_failure();
        warn!(connection_id = %connection.id(), error = %error, "delivery failure escalated");
        // Primaries whose events this connection was carrying.
        let served: Vec<ConnectionId> = if connection.is_backup() {
            self.active
                .iter()
                .filter(|r| &r.backup_connection_id == connection.id())
                .map(|r| r.key().clone())
                .collect()
        } else {
            vec![connection.id().clone()]
        };

        if let Err(e) = self
            .registry
            .mark_health(connection.id(), ConnectionStatus::Disconnected)
        {
            debug!(connection_id = %connection.id(), error = %e, "could not mark connection disconnected");
        }

        served.iter().find_map(|primary| self.backup_for(primary))
    }

    fn fail_over(&self, primary: &Arc<ClientConnection>) {
        if !self.enabled {
            self.refresh_offline(primary.user_id());
            return;
        }
        match self.pick_backup(primary.user_id(), &[primary.id()]) {
            Some(backup) => {
                let record = FailoverRecord {
                    user_id: primary.user_id().clone(),
                    primary_connection_id: primary.id().clone(),
                    backup_connection_id: backup.id().clone(),
                    failed_at: Utc::now(),
                    recovered_at: None,
                };
                let _ = self.active.insert(primary.id().clone(), record);
                self.metrics.increment(
                    telemetry::FAILOVER_COUNT,
                    &[("user_id", primary.user_id().to_string())],
                );
                info!(
                    user_id = %primary.user_id(),
                    primary = %primary.id(),
                    backup = %backup.id(),
                    "failed over to backup"
                );
            }
            None => {
                warn!(user_id = %primary.user_id(), primary = %primary.id(), "failover exhausted: no healthy backup");
                self.refresh_offline(primary.user_id());
            }
        }
    }

    /// A backup went away: move each record it served to another backup.
    fn replace_backup(&self, backup: &Arc<ClientConnection>) {
        let served: Vec<ConnectionId> = self
            .active
            .iter()
            .filter(|r| &r.backup_connection_id == backup.id())
            .map(|r| r.key().clone())
            .collect();
        for primary in served {
            match self.pick_backup(backup.user_id(), &[&primary, backup.id()]) {
                Some(next) => {
                    if let Some(mut record) = self.active.get_mut(&primary) {
                        record.backup_connection_id = next.id().clone();
                    }
                    self.metrics.increment(
                        telemetry::FAILOVER_COUNT,
                        &[("user_id", backup.user_id().to_string())],
                    );
                    info!(%primary, failed_backup = %backup.id(), backup = %next.id(), "backup replaced");
                }
                None => {
                    warn!(%primary, failed_backup = %backup.id(), "backup lost and no replacement");
                }
            }
        }
        self.refresh_offline(backup.user_id());
    }

    fn close_record(&self, primary: &ConnectionId, recovered: bool) {
        let Some((_, mut record)) = self.active.remove(primary) else {
            return;
        };
        if recovered {
            record.recovered_at = Some(Utc::now());
            self.metrics.increment(
                telemetry::FAILOVER_RECOVERIES,
                &[("user_id", record.user_id.to_string())],
            );
            info!(user_id = %record.user_id, %primary, "primary recovered, routing reverted");
        } else {
            info!(user_id = %record.user_id, %primary, "primary unregistered, failover closed");
        }
        self.history
            .entry(record.user_id.clone())
            .or_default()
            .push(record);
    }

    fn pick_backup(
        &self,
        user_id: &UserId,
        exclude: &[&ConnectionId],
    ) -> Option<Arc<ClientConnection>> {
        self.registry
            .get_connections_for(user_id)
            .into_iter()
            .find(|c| c.is_backup() && c.is_deliverable() && !exclude.contains(&c.id()))
    }

    /// Recompute the offline flag from the user's current connections.
    fn refresh_offline(&self, user_id: &UserId) {
        let reachable = self
            .registry
            .get_connections_for(user_id)
            .iter()
            .any(|c| c.is_deliverable());
        if reachable {
            let _ = self.offline.remove(user_id);
        } else if self.offline.insert(user_id.clone()) {
            warn!(%user_id, "user offline");
        }
    }
}

impl HealthObserver for FailoverCoordinator {
    fn on_transition(
        &self,
        connection: &Arc<ClientConnection>,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) {
        match (connection.role(), to) {
            (ConnectionRole::Primary, ConnectionStatus::Disconnected) => self.fail_over(connection),
            (ConnectionRole::Primary, ConnectionStatus::Active)
                if from == ConnectionStatus::Disconnected =>
            {
                self.close_record(connection.id(), true);
                self.refresh_offline(connection.user_id());
            }
            (ConnectionRole::Primary, ConnectionStatus::Terminated) => {
                self.close_record(connection.id(), false);
                self.refresh_offline(connection.user_id());
            }
            (ConnectionRole::Backup, ConnectionStatus::Disconnected | ConnectionStatus::Terminated) => {
                self.replace_backup(connection);
            }
            (_, status) if status.is_deliverable() => {
                let _ = self.offline.remove(connection.user_id());
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for FailoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverCoordinator")
            .field("enabled", &self.enabled)
            .field("active", &self.active.len())
            .field("offline", &self.offline.len())
            .finish_non_exhaustive()
    }
}
