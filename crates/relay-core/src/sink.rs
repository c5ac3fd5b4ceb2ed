//! The seam between agent sessions and the router.
//!
//! An agent bridge owns an `Arc<dyn EventSink>` and nothing else that can reach
//! a connection. The server's event router is the production implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{DeliveryError, RouteError};
use crate::events::{EmitRequest, Event};
use crate::ids::{ConnectionId, ThreadId, UserId};

/// Destination for emitted lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sequence, validate, and deliver one event.
    async fn route(&self, request: EmitRequest) -> Result<DeliveryOutcome, RouteError>;

    /// Drop per-thread routing state once the session that used the thread
    /// is gone. The next event on the thread starts a fresh sequence.
    async fn release_thread(&self, _user_id: &UserId, _thread_id: &ThreadId) {}
}

/// What happened on one connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Sent on this connection.
    Delivered,
    /// Sending here failed and the event went to the named backup instead.
    Rerouted {
        /// Backup that received the event.
        backup: ConnectionId,
    },
    /// Not delivered here, and no backup took it.
    Failed(DeliveryError),
}

/// Per-connection delivery result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDelivery {
    /// Target connection.
    pub connection_id: ConnectionId,
    /// Outcome.
    pub status: DeliveryStatus,
}

impl ConnectionDelivery {
    /// Whether the event reached the client through this target or its backup.
    pub fn reached_client(&self) -> bool {
        !matches!(self.status, DeliveryStatus::Failed(_))
    }
}

/// Result of routing one event.
#[derive(Clone, Debug)]
pub struct DeliveryOutcome {
    /// The stamped event.
    pub event: Arc<Event>,
    /// One entry per target connection.
    pub deliveries: Vec<ConnectionDelivery>,
}

impl DeliveryOutcome {
    /// Sequence number the router assigned.
    pub fn sequence_no(&self) -> u64 {
        self.event.sequence_no()
    }

    /// Number of targets the event reached.
    pub fn delivered_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.reached_client()).count()
    }

    /// Whether at least one target received the event.
    pub fn any_delivered(&self) -> bool {
        self.deliveries.iter().any(ConnectionDelivery::reached_client)
    }

    /// Failures that were not absorbed by a backup.
    pub fn failures(&self) -> impl Iterator<Item = &DeliveryError> {
        self.deliveries.iter().filter_map(|d| match &d.status {
            DeliveryStatus::Failed(e) => Some(e),
            _ => None,
        })
    }
}
