//! User-scoped event router.
//!
//! `route` stamps the event with the next sequence number of its
//! (user, thread), resolves the owner's connections, re-checks ownership of
//! every resolved connection, and hands off to the broadcast service. The
//! per-thread lock is held from sequence assignment through delivery, so
//! two emitters on one thread cannot invert order at any connection.
//! Held offline events are flushed under the same lock as the thread they
//! belong to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::errors::{IsolationViolation, RouteError};
use relay_core::events::{EmitRequest, Event};
use relay_core::ids::{ThreadId, UserId};
use relay_core::sink::{DeliveryOutcome, EventSink};
use relay_core::telemetry::{self, MetricsSink};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, instrument, warn};

use crate::broadcast::BroadcastService;
use crate::connection::ClientConnection;
use crate::failover::FailoverCoordinator;
use crate::registry::ConnectionRegistry;

/// Router counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Events stamped and handed to broadcast.
    pub routed: u64,
    /// Events with no connection to go to (buffered or dropped).
    pub undeliverable: u64,
    /// Events rejected for addressing another user's connection.
    pub isolation_violations: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    undeliverable: AtomicU64,
    isolation_violations: AtomicU64,
}

/// Routes each user's events to that user's connections only.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    broadcast: Arc<BroadcastService>,
    coordinator: Arc<FailoverCoordinator>,
    /// Last sequence number per (user, thread).
    sequencers: DashMap<(UserId, ThreadId), Arc<Mutex<u64>>>,
    counters: Counters,
    metrics: Arc<dyn MetricsSink>,
}

impl EventRouter {
    /// Create a router.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcast: Arc<BroadcastService>,
        coordinator: Arc<FailoverCoordinator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            broadcast,
            coordinator,
            sequencers: DashMap::new(),
            counters: Counters::default(),
            metrics,
        }
    }

    /// Sequence, validate, and deliver one event.
    #[instrument(skip_all, fields(user_id = %request.user_id, thread_id = %request.thread_id, event_type = %request.event_type))]
    pub async fn route(&self, request: EmitRequest) -> Result<DeliveryOutcome, RouteError> {
        let started = Instant::now();
        let mut last_seq = self.lock_sequencer(&request.user_id, &request.thread_id).await;

        if self
            .coordinator
            .buffer()
            .has_pending_thread(&request.user_id, &request.thread_id)
        {
            let _ = self.flush_thread(&request.user_id, &request.thread_id).await;
        }

        *last_seq += 1;
        let event = Arc::new(Event::stamp(request, *last_seq));
        let user_tags = [("user_id", event.user_id().to_string())];

        let targets = match self.resolve_targets(&event) {
            Ok(targets) => targets,
            Err(e) => {
                self.record_unrouted(&event, &e);
                return Err(e);
            }
        };

        let deliveries = self.broadcast.deliver(&event, &targets).await;
        let outcome = DeliveryOutcome {
            event: Arc::clone(&event),
            deliveries,
        };
        if !outcome.any_delivered() && self.coordinator.is_offline(event.user_id()) {
            let _ = self.coordinator.hold(Arc::clone(&event));
        }
        drop(last_seq);
        let _ = self.counters.routed.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment(telemetry::EVENTS_ROUTED, &user_tags);
        self.metrics.record_metric(
            telemetry::ROUTING_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
            &user_tags,
        );
        debug!(
            sequence_no = event.sequence_no(),
            delivered = outcome.delivered_count(),
            targets = outcome.deliveries.len(),
            "event routed"
        );
        Ok(outcome)
    }

    /// Resolve the connections an event goes to.
    fn resolve_targets(&self, event: &Event) -> Result<Vec<Arc<ClientConnection>>, RouteError> {
        let user_id = event.user_id();
        let candidates = match event.connection_id() {
            Some(hint) => {
                let connection = self.registry.get(hint).ok_or_else(|| RouteError::ConnectionNotFound {
                    user_id: user_id.clone(),
                    connection_id: Some(hint.clone()),
                })?;
                vec![connection]
            }
            None => self
                .registry
                .get_connections_for(user_id)
                .into_iter()
                .filter(|c| c.is_subscribed(event.thread_id()))
                .collect(),
        };
        if candidates.is_empty() {
            return Err(RouteError::ConnectionNotFound {
                user_id: user_id.clone(),
                connection_id: None,
            });
        }
        Self::check_owner(event, &candidates)?;

        let has_primary = candidates.iter().any(|c| !c.is_backup());
        let mut targets: Vec<Arc<ClientConnection>> = Vec::with_capacity(candidates.len());
        for connection in candidates {
            let chosen = if connection.is_deliverable() && (!has_primary || !connection.is_backup()) {
                Some(connection)
            } else if connection.is_backup() {
                None
            } else {
                self.coordinator.backup_for(connection.id())
            };
            if let Some(c) = chosen {
                if !targets.iter().any(|t| t.id() == c.id()) {
                    targets.push(c);
                }
            }
        }
        if targets.is_empty() {
            return Err(RouteError::FailoverExhausted {
                user_id: user_id.clone(),
            });
        }
        // Backups come from the coordinator; check them too.
        Self::check_owner(event, &targets)?;
        Ok(targets)
    }

    fn check_owner(event: &Event, connections: &[Arc<ClientConnection>]) -> Result<(), RouteError> {
        match connections.iter().find(|c| c.user_id() != event.user_id()) {
            Some(foreign) => Err(IsolationViolation {
                requester: event.user_id().clone(),
                owner: foreign.user_id().clone(),
                resource: format!("connection {}", foreign.id()),
            }
            .into()),
            None => Ok(()),
        }
    }

    fn record_unrouted(&self, event: &Arc<Event>, error: &RouteError) {
        let tags = [("user_id", event.user_id().to_string())];
        if let RouteError::Isolation(violation) = error {
            let _ = self.counters.isolation_violations.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(telemetry::ISOLATION_VIOLATIONS, &tags);
            error!(%violation, sequence_no = event.sequence_no(), "event rejected: cross-user delivery");
            return;
        }
        let _ = self.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
        let outcome = self.coordinator.hold(Arc::clone(event));
        warn!(error = %error, category = error.category(), ?outcome, "event undeliverable");
    }

    /// Deliver the user's buffered events, oldest first within each thread.
    /// Each thread is flushed under its sequencer lock. Returns how many
    /// reached at least one connection.
    pub async fn flush_offline(&self, user_id: &UserId) -> usize {
        let mut delivered = 0;
        for thread_id in self.coordinator.buffer().pending_threads(user_id) {
            let _guard = self.lock_sequencer(user_id, &thread_id).await;
            delivered += self.flush_thread(user_id, &thread_id).await;
        }
        delivered
    }

    /// Deliver one thread's buffered events. The caller holds the thread's
    /// sequencer lock.
    async fn flush_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> usize {
        let (events, expired) = self.coordinator.buffer().drain_thread(user_id, thread_id);
        if expired > 0 {
            self.metrics.record_metric(
                telemetry::EVENTS_DROPPED,
                expired as f64,
                &[("user_id", user_id.to_string())],
            );
        }
        let mut delivered = 0;
        let mut pending = events.into_iter();
        while let Some(event) = pending.next() {
            let Ok(targets) = self.resolve_targets(&event) else {
                // Still nowhere to go: put this and the rest back, in order.
                for held in std::iter::once(event).chain(pending) {
                    let _ = self.coordinator.hold(held);
                }
                break;
            };
            let deliveries = self.broadcast.deliver(&event, &targets).await;
            if deliveries.iter().any(|d| d.reached_client()) {
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!(%user_id, %thread_id, delivered, "offline buffer flushed");
        }
        delivered
    }

    /// Drop the sequencer of a finished thread and the delivery cursors the
    /// user's connections keep for it. A later event on the thread starts
    /// again at 1. A thread with held events is kept until they are flushed.
    #[instrument(skip(self))]
    pub async fn forget_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> bool {
        let key = (user_id.clone(), thread_id.clone());
        let Some(sequencer) = self.sequencers.get(&key).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        let _guard = Arc::clone(&sequencer).lock_owned().await;
        if self.coordinator.buffer().has_pending_thread(user_id, thread_id) {
            debug!("thread still has held events, kept");
            return false;
        }
        let removed = self
            .sequencers
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &sequencer))
            .is_some();
        if removed {
            let connections: Vec<_> = self
                .registry
                .get_connections_for(user_id)
                .iter()
                .map(|c| c.id().clone())
                .collect();
            self.broadcast.forget_thread(&connections, thread_id).await;
            debug!("thread state released");
        }
        removed
    }

    /// Last sequence number assigned on a thread.
    pub async fn last_sequence(&self, user_id: &UserId, thread_id: &ThreadId) -> Option<u64> {
        let sequencer = self
            .sequencers
            .get(&(user_id.clone(), thread_id.clone()))
            .map(|s| Arc::clone(s.value()))?;
        let last = *sequencer.lock().await;
        Some(last)
    }

    /// Counters.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            undeliverable: self.counters.undeliverable.load(Ordering::Relaxed),
            isolation_violations: self.counters.isolation_violations.load(Ordering::Relaxed),
        }
    }

    fn sequencer(&self, user_id: &UserId, thread_id: &ThreadId) -> Arc<Mutex<u64>> {
        Arc::clone(
            self.sequencers
                .entry((user_id.clone(), thread_id.clone()))
                .or_default()
                .value(),
        )
    }

    /// Lock the thread's sequencer. Retries when the thread was forgotten
    /// while waiting, so the guard always belongs to the live entry.
    async fn lock_sequencer(&self, user_id: &UserId, thread_id: &ThreadId) -> OwnedMutexGuard<u64> {
        let key = (user_id.clone(), thread_id.clone());
        loop {
            let sequencer = self.sequencer(user_id, thread_id);
            let guard = Arc::clone(&sequencer).lock_owned().await;
            let live = self
                .sequencers
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &sequencer));
            if live {
                return guard;
            }
        }
    }
}

#[async_trait]
impl EventSink for EventRouter {
    async fn route(&self, request: EmitRequest) -> Result<DeliveryOutcome, RouteError> {
        EventRouter::route(self, request).await
    }

    async fn release_thread(&self, user_id: &UserId, thread_id: &ThreadId) {
        let _ = self.forget_thread(user_id, thread_id).await;
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("threads", &self.sequencers.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
