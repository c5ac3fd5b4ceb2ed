//! Connection registry, sharded by user.
//!
//! Each shard owns the connections of the users that hash to it and
//! serializes its own mutations. A connection-to-owner index answers lookups
//! by connection ID without touching the shards and rejects reused IDs.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use relay_core::errors::RegistryError;
use relay_core::health::ConnectionStatus;
use relay_core::ids::{ConnectionId, ThreadId, UserId};
use relay_core::telemetry::{self, MetricsSink};
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionRegistration};

/// Notified synchronously after every applied health transition.
pub trait HealthObserver: Send + Sync {
    /// `connection` moved from `from` to `to`.
    fn on_transition(
        &self,
        connection: &Arc<ClientConnection>,
        from: ConnectionStatus,
        to: ConnectionStatus,
    );
}

#[derive(Default)]
struct Shard {
    /// Connections per user, in registration order.
    by_user: HashMap<UserId, Vec<Arc<ClientConnection>>>,
}

/// Live connections keyed by (user, connection ID).
pub struct ConnectionRegistry {
    shards: Vec<RwLock<Shard>>,
    owners: DashMap<ConnectionId, UserId>,
    hasher: RandomState,
    observers: RwLock<Vec<Arc<dyn HealthObserver>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionRegistry {
    /// Create a registry with `shards` partitions (at least one).
    pub fn new(shards: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(Shard::default())).collect(),
            owners: DashMap::new(),
            hasher: RandomState::new(),
            observers: RwLock::new(Vec::new()),
            metrics,
        }
    }

    fn shard(&self, user_id: &UserId) -> &RwLock<Shard> {
        let idx = (self.hasher.hash_one(user_id) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Register an observer for health transitions.
    pub fn add_observer(&self, observer: Arc<dyn HealthObserver>) {
        self.observers.write().push(observer);
    }

    /// Register an authenticated connection in the `connecting` state.
    pub fn register(
        &self,
        registration: ConnectionRegistration,
    ) -> Result<Arc<ClientConnection>, RegistryError> {
        match self.owners.entry(registration.connection_id.clone()) {
            Entry::Occupied(_) => {
                return Err(RegistryError::DuplicateConnection(registration.connection_id));
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(registration.user_id.clone());
            }
        }
        let connection = Arc::new(ClientConnection::new(registration));
        self.shard(connection.user_id())
            .write()
            .by_user
            .entry(connection.user_id().clone())
            .or_default()
            .push(Arc::clone(&connection));
        info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            role = ?connection.role(),
            "connection registered"
        );
        Ok(connection)
    }

    /// Remove a connection and mark it terminated.
    pub fn unregister(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<ClientConnection>, RegistryError> {
        let (_, user_id) = self
            .owners
            .remove(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;
        let removed = {
            let mut shard = self.shard(&user_id).write();
            let removed = shard.by_user.get_mut(&user_id).and_then(|conns| {
                let pos = conns.iter().position(|c| c.id() == connection_id)?;
                Some(conns.remove(pos))
            });
            if shard.by_user.get(&user_id).is_some_and(Vec::is_empty) {
                let _ = shard.by_user.remove(&user_id);
            }
            removed
        }
        .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;

        if let Ok(Some(from)) = removed.transition(ConnectionStatus::Terminated) {
            self.after_transition(&removed, from, ConnectionStatus::Terminated);
        }
        info!(%connection_id, %user_id, "connection unregistered");
        Ok(removed)
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let user_id = self.owners.get(connection_id)?.value().clone();
        self.shard(&user_id)
            .read()
            .by_user
            .get(&user_id)?
            .iter()
            .find(|c| c.id() == connection_id)
            .cloned()
    }

    /// Every registered connection of `user_id`, whatever its status, in
    /// registration order.
    pub fn get_connections_for(&self, user_id: &UserId) -> Vec<Arc<ClientConnection>> {
        self.shard(user_id)
            .read()
            .by_user
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply a health transition. Returns the previous status.
    ///
    /// Marking the current status again changes nothing and notifies no one.
    pub fn mark_health(
        &self,
        connection_id: &ConnectionId,
        status: ConnectionStatus,
    ) -> Result<ConnectionStatus, RegistryError> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;
        match connection.transition(status)? {
            Some(from) => {
                self.after_transition(&connection, from, status);
                Ok(from)
            }
            None => Ok(status),
        }
    }

    fn after_transition(
        &self,
        connection: &Arc<ClientConnection>,
        from: ConnectionStatus,
        to: ConnectionStatus,
    ) {
        self.metrics.increment(
            telemetry::HEALTH_TRANSITIONS,
            &[("from", from.to_string()), ("to", to.to_string())],
        );
        if to.is_deliverable() {
            debug!(connection_id = %connection.id(), %from, %to, "connection health changed");
        } else {
            warn!(connection_id = %connection.id(), user_id = %connection.user_id(), %from, %to, "connection health changed");
        }
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_transition(connection, from, to);
        }
    }

    /// Subscribe a connection to a thread.
    pub fn bind_thread(
        &self,
        connection_id: &ConnectionId,
        thread_id: ThreadId,
    ) -> Result<(), RegistryError> {
        self.get(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?
            .bind_thread(thread_id);
        Ok(())
    }

    /// Record client activity (pong).
    pub fn touch(&self, connection_id: &ConnectionId) -> Result<(), RegistryError> {
        self.get(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?
            .mark_alive();
        Ok(())
    }

    /// Wait until the connection leaves `connecting`. Returns the status it
    /// moved to.
    pub async fn wait_for_handshake(
        &self,
        connection_id: &ConnectionId,
        timeout: Duration,
    ) -> Result<ConnectionStatus, RegistryError> {
        let mut rx = self
            .get(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?
            .subscribe_status();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != ConnectionStatus::Connecting),
        )
        .await;
        match waited {
            Ok(Ok(status)) => Ok(*status),
            // Sender dropped: the connection is gone.
            Ok(Err(_)) => Err(RegistryError::UnknownConnection(connection_id.clone())),
            Err(_) => Err(RegistryError::HandshakeTimeout(connection_id.clone())),
        }
    }

    /// Registered connections.
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    /// Users with at least one registered connection.
    pub fn user_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().by_user.len()).sum()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("shards", &self.shards.len())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
