//! Outbound transport seam.
//!
//! The host implements [`Transport`] over its socket layer. [`ChannelTransport`]
//! is the in-process implementation: each connection gets a bounded mpsc
//! channel whose receiver the host's write task drains.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::errors::DeliveryError;
use relay_core::ids::ConnectionId;
use tokio::sync::mpsc;

/// Sends serialized events to a client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one serialized event. May suspend while the client is slow; the
    /// caller bounds the wait.
    async fn send(&self, connection_id: &ConnectionId, payload: Arc<String>)
    -> Result<(), DeliveryError>;
}

/// In-process transport backed by one bounded channel per connection.
#[derive(Debug)]
pub struct ChannelTransport {
    senders: DashMap<ConnectionId, mpsc::Sender<Arc<String>>>,
    capacity: usize,
}

impl ChannelTransport {
    /// Create a transport whose channels hold up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open the channel for a connection, replacing any previous one.
    pub fn attach(&self, connection_id: ConnectionId) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let _ = self.senders.insert(connection_id, tx);
        rx
    }

    /// Drop the connection's channel. Later sends fail with `Closed`.
    pub fn detach(&self, connection_id: &ConnectionId) -> bool {
        self.senders.remove(connection_id).is_some()
    }

    /// Number of attached channels.
    pub fn attached(&self) -> usize {
        self.senders.len()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        connection_id: &ConnectionId,
        payload: Arc<String>,
    ) -> Result<(), DeliveryError> {
        // Clone the sender so no map guard is held across the await.
        let tx = self
            .senders
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeliveryError::Closed(connection_id.clone()))?;
        tx.send(payload)
            .await
            .map_err(|_| DeliveryError::Closed(connection_id.clone()))
    }
}
