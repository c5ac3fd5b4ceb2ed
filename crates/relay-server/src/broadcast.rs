//! Event fan-out to a user's connections.
//!
//! An event is serialized once and the resulting `Arc<String>` is shared by
//! every recipient. Each connection has a delivery cursor behind an async
//! mutex, so at most one send is in flight per connection and the cursor
//! check and the send happen under the same lock. Different connections are
//! served concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use relay_core::errors::DeliveryError;
use relay_core::events::Event;
use relay_core::ids::{ConnectionId, ThreadId};
use relay_core::sink::{ConnectionDelivery, DeliveryStatus};
use relay_core::telemetry::{self, MetricsSink};
use relay_settings::EngineOptions;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::failover::FailoverCoordinator;
use crate::transport::Transport;

/// Last sequence number delivered per thread on one connection.
type Cursor = Arc<Mutex<HashMap<ThreadId, u64>>>;

/// Delivers events to connections with bounded retries and failover.
pub struct BroadcastService {
    transport: Arc<dyn Transport>,
    coordinator: Arc<FailoverCoordinator>,
    cursors: DashMap<ConnectionId, Cursor>,
    send_timeout: Duration,
    max_retry: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl BroadcastService {
    /// Create a broadcast service.
    pub fn new(
        transport: Arc<dyn Transport>,
        coordinator: Arc<FailoverCoordinator>,
        options: &EngineOptions,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            transport,
            coordinator,
            cursors: DashMap::new(),
            send_timeout: options.send_timeout(),
            max_retry: options.max_retry_per_connection,
            metrics,
        }
    }

    /// Deliver `event` to every target. One result per target, in target order.
    pub async fn deliver(
        &self,
        event: &Arc<Event>,
        targets: &[Arc<ClientConnection>],
    ) -> Vec<ConnectionDelivery> {
        let payload = match serde_json::to_string(event.as_ref()) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(event_type = %event.event_type(), error = %e, "failed to serialize event");
                return targets
                    .iter()
                    .map(|c| ConnectionDelivery {
                        connection_id: c.id().clone(),
                        status: DeliveryStatus::Failed(DeliveryError::Transport {
                            connection_id: c.id().clone(),
                            message: e.to_string(),
                        }),
                    })
                    .collect();
            }
        };
        debug!(
            event_type = %event.event_type(),
            user_id = %event.user_id(),
            sequence_no = event.sequence_no(),
            recipients = targets.len(),
            "broadcast event"
        );
        let target_ids: Vec<&ConnectionId> = targets.iter().map(|c| c.id()).collect();
        join_all(
            targets
                .iter()
                .map(|conn| self.deliver_one(conn, event, &payload, &target_ids)),
        )
        .await
    }

    async fn deliver_one(
        &self,
        connection: &Arc<ClientConnection>,
        event: &Event,
        payload: &Arc<String>,
        target_ids: &[&ConnectionId],
    ) -> ConnectionDelivery {
        let status = match self.send_ordered(connection, event, payload).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(e) if !e.escalates() => {
                warn!(connection_id = %connection.id(), error = %e, "ordering anomaly, event not sent");
                self.metrics.increment(
                    telemetry::ORDERING_ANOMALIES,
                    &[("user_id", event.user_id().to_string())],
                );
                DeliveryStatus::Failed(e)
            }
            Err(e) => {
                self.metrics.increment(
                    telemetry::DELIVERY_FAILURES,
                    &[("category", e.category().to_string())],
                );
                match self.coordinator.report_failure(connection, &e) {
                    // Already a target of this fan-out; its own delivery covers it.
                    Some(backup) if target_ids.contains(&backup.id()) => DeliveryStatus::Rerouted {
                        backup: backup.id().clone(),
                    },
                    Some(backup) => self.reroute(&backup, event, payload, e).await,
                    None => DeliveryStatus::Failed(e),
                }
            }
        };
        ConnectionDelivery {
            connection_id: connection.id().clone(),
            status,
        }
    }

    async fn reroute(
        &self,
        backup: &Arc<ClientConnection>,
        event: &Event,
        payload: &Arc<String>,
        original: DeliveryError,
    ) -> DeliveryStatus {
        if backup.user_id() != event.user_id() {
            // The coordinator only picks backups of the same user.
            return DeliveryStatus::Failed(original);
        }
        match self.send_ordered(backup, event, payload).await {
            Ok(()) => {
                debug!(backup = %backup.id(), sequence_no = event.sequence_no(), "event rerouted to backup");
                DeliveryStatus::Rerouted {
                    backup: backup.id().clone(),
                }
            }
            Err(e) => {
                warn!(backup = %backup.id(), error = %e, "reroute to backup failed");
                self.metrics.increment(
                    telemetry::DELIVERY_FAILURES,
                    &[("category", e.category().to_string())],
                );
                if e.escalates() {
                    let _ = self.coordinator.report_failure(backup, &e);
                }
                DeliveryStatus::Failed(e)
            }
        }
    }

    /// Send under the connection's cursor lock, rejecting out-of-order events.
    async fn send_ordered(
        &self,
        connection: &ClientConnection,
        event: &Event,
        payload: &Arc<String>,
    ) -> Result<(), DeliveryError> {
        let cursor = self.cursor(connection.id());
        let mut delivered = cursor.lock().await;
        let last = delivered.get(event.thread_id()).copied().unwrap_or(0);
        if event.sequence_no() <= last {
            return Err(DeliveryError::OrderingAnomaly {
                connection_id: connection.id().clone(),
                thread_id: event.thread_id().clone(),
                last_delivered: last,
                received: event.sequence_no(),
            });
        }
        self.send_with_retry(connection.id(), payload).await?;
        let _ = delivered.insert(event.thread_id().clone(), event.sequence_no());
        connection.record_delivery();
        Ok(())
    }

    async fn send_with_retry(
        &self,
        connection_id: &ConnectionId,
        payload: &Arc<String>,
    ) -> Result<(), DeliveryError> {
        let attempts = self.max_retry + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let sent = tokio::time::timeout(
                self.send_timeout,
                self.transport.send(connection_id, Arc::clone(payload)),
            )
            .await;
            match sent {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(DeliveryError::Timeout {
                        connection_id: connection_id.clone(),
                        attempts: attempt,
                    });
                }
            }
            if attempt < attempts {
                self.metrics.increment(
                    telemetry::DELIVERY_RETRIES,
                    &[("connection_id", connection_id.to_string())],
                );
                debug!(%connection_id, attempt, "retrying send");
            }
        }
        Err(last_error.unwrap_or(DeliveryError::Timeout {
            connection_id: connection_id.clone(),
            attempts,
        }))
    }

    fn cursor(&self, connection_id: &ConnectionId) -> Cursor {
        Arc::clone(
            self.cursors
                .entry(connection_id.clone())
                .or_default()
                .value(),
        )
    }

    /// Drop a connection's cursor.
    pub fn forget_connection(&self, connection_id: &ConnectionId) {
        let _ = self.cursors.remove(connection_id);
    }

    /// Drop the per-thread cursor of `thread_id` on each of `connections`.
    pub async fn forget_thread(&self, connections: &[ConnectionId], thread_id: &ThreadId) {
        for connection_id in connections {
            let Some(cursor) = self.cursors.get(connection_id).map(|c| Arc::clone(c.value())) else {
                continue;
            };
            let _ = cursor.lock().await.remove(thread_id);
        }
    }

    /// Last sequence number delivered on `connection_id` for `thread_id`.
    pub async fn last_delivered(
        &self,
        connection_id: &ConnectionId,
        thread_id: &ThreadId,
    ) -> Option<u64> {
        let cursor = self.cursors.get(connection_id).map(|c| Arc::clone(c.value()))?;
        let delivered = cursor.lock().await;
        delivered.get(thread_id).copied()
    }
}

impl std::fmt::Debug for BroadcastService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastService")
            .field("send_timeout", &self.send_timeout)
            .field("max_retry", &self.max_retry)
            .field("connections", &self.cursors.len())
            .finish_non_exhaustive()
    }
}
