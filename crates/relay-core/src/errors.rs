//! Error taxonomy for the relay engine.
//!
//! Failures fall into two classes that never share a type or a propagation
//! path:
//!
//! - **Security**: [`IsolationViolation`]. An event addressed a resource owned
//!   by another user. Always surfaced, never retried, never logged-and-continued.
//! - **Operational**: [`RegistryError`], [`DeliveryError`], and the non-isolation
//!   variants of [`RouteError`]. Logged, counted, retried, or buffered.

use thiserror::Error;

use crate::health::ConnectionStatus;
use crate::ids::{ConnectionId, RunId, ThreadId, UserId};

/// An event or context reached a resource owned by a different user.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("isolation violation: {resource} owned by user {owner} addressed by user {requester}")]
pub struct IsolationViolation {
    /// User the event or context belongs to.
    pub requester: UserId,
    /// User that owns the resource that was reached.
    pub owner: UserId,
    /// What was reached (`connection <id>`, `session bridge`, ...).
    pub resource: String,
}

/// Connection registry failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A connection with this ID is already registered.
    #[error("duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),

    /// No connection with this ID is registered.
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The requested health transition is not allowed.
    #[error("invalid transition for {connection_id}: {from} -> {to}")]
    InvalidTransition {
        /// Connection being updated.
        connection_id: ConnectionId,
        /// Current status.
        from: ConnectionStatus,
        /// Requested status.
        to: ConnectionStatus,
    },

    /// The connection did not finish its handshake in time.
    #[error("handshake timed out for {0}")]
    HandshakeTimeout(ConnectionId),
}

/// Per-connection delivery failures.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Every attempt exceeded the send timeout.
    #[error("delivery to {connection_id} timed out after {attempts} attempt(s)")]
    Timeout {
        /// Target connection.
        connection_id: ConnectionId,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// The transport reports the connection closed.
    #[error("connection closed: {0}")]
    Closed(ConnectionId),

    /// Other transport failure.
    #[error("transport error on {connection_id}: {message}")]
    Transport {
        /// Target connection.
        connection_id: ConnectionId,
        /// Transport-provided description.
        message: String,
    },

    /// The event's sequence number is not ahead of the last one delivered
    /// for its thread on this connection. The event was not sent.
    #[error(
        "ordering anomaly on {connection_id} for thread {thread_id}: got {received} after {last_delivered}"
    )]
    OrderingAnomaly {
        /// Target connection.
        connection_id: ConnectionId,
        /// Thread whose order would break.
        thread_id: ThreadId,
        /// Last sequence number delivered on this connection for the thread.
        last_delivered: u64,
        /// Sequence number that arrived.
        received: u64,
    },
}

impl DeliveryError {
    /// Whether a retry on the same connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    /// Whether the failure should be escalated to the failover coordinator.
    pub fn escalates(&self) -> bool {
        !matches!(self, Self::OrderingAnomaly { .. })
    }

    /// Metric tag for this failure.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Closed(_) => "closed",
            Self::Transport { .. } => "transport",
            Self::OrderingAnomaly { .. } => "ordering_anomaly",
        }
    }
}

/// Failures of a single `route` call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouteError {
    /// Security failure. Never recovered locally.
    #[error(transparent)]
    Isolation(#[from] IsolationViolation),

    /// The user has no live connection, or the target hint names an unregistered one.
    #[error("no connection for user {user_id}")]
    ConnectionNotFound {
        /// Event owner.
        user_id: UserId,
        /// Target hint, when the event named one.
        connection_id: Option<ConnectionId>,
    },

    /// The user has connections but none can receive, and no backup is healthy.
    #[error("failover exhausted for user {user_id}")]
    FailoverExhausted {
        /// Event owner.
        user_id: UserId,
    },

    /// The run already emitted its terminal event.
    #[error("stale run: {0}")]
    StaleRun(RunId),

    /// The session's bridge was closed during cleanup.
    #[error("session closed for user {0}")]
    SessionClosed(UserId),
}

impl RouteError {
    /// Whether the error must abort the caller instead of being absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Isolation(_))
    }

    /// Error category string for logs and metric tags.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Isolation(_) => "isolation_violation",
            Self::ConnectionNotFound { .. } => "connection_not_found",
            Self::FailoverExhausted { .. } => "failover_exhausted",
            Self::StaleRun(_) => "stale_run",
            Self::SessionClosed(_) => "session_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn violation() -> IsolationViolation {
        IsolationViolation {
            requester: UserId::from("alice"),
            owner: UserId::from("bob"),
            resource: "connection c9".into(),
        }
    }

    #[test]
    fn isolation_display_names_both_users() {
        let msg = violation().to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("bob"));
        assert!(msg.contains("connection c9"));
    }

    #[test]
    fn only_isolation_is_fatal() {
        assert!(RouteError::from(violation()).is_fatal());
        let not_found = RouteError::ConnectionNotFound {
            user_id: UserId::from("alice"),
            connection_id: None,
        };
        assert!(!not_found.is_fatal());
        assert!(!RouteError::FailoverExhausted { user_id: UserId::from("a") }.is_fatal());
        assert!(!RouteError::StaleRun(RunId::from("r")).is_fatal());
    }

    #[test]
    fn isolation_converts_via_from() {
        let err: RouteError = violation().into();
        assert_matches!(err, RouteError::Isolation(v) if v.owner.as_str() == "bob");
    }

    #[test]
    fn route_categories() {
        assert_eq!(RouteError::from(violation()).category(), "isolation_violation");
        assert_eq!(
            RouteError::SessionClosed(UserId::from("u")).category(),
            "session_closed"
        );
    }

    #[test]
    fn delivery_classification() {
        let timeout = DeliveryError::Timeout {
            connection_id: ConnectionId::from("c"),
            attempts: 3,
        };
        assert!(timeout.is_transient());
        assert!(timeout.escalates());

        let closed = DeliveryError::Closed(ConnectionId::from("c"));
        assert!(!closed.is_transient());
        assert!(closed.escalates());

        let anomaly = DeliveryError::OrderingAnomaly {
            connection_id: ConnectionId::from("c"),
            thread_id: ThreadId::from("t"),
            last_delivered: 4,
            received: 2,
        };
        assert!(!anomaly.is_transient());
        assert!(!anomaly.escalates());
        assert_eq!(anomaly.category(), "ordering_anomaly");
    }

    #[test]
    fn invalid_transition_display() {
        let err = RegistryError::InvalidTransition {
            connection_id: ConnectionId::from("c1"),
            from: ConnectionStatus::Terminated,
            to: ConnectionStatus::Active,
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for c1: terminated -> active"
        );
        assert_eq!(
            RegistryError::HandshakeTimeout(ConnectionId::from("c2")).to_string(),
            "handshake timed out for c2"
        );
    }
}
