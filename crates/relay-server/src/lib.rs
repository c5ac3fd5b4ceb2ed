//! # relay-server
//!
//! User-scoped delivery of agent lifecycle events to client connections.
//!
//! - [`registry::ConnectionRegistry`]: live connections sharded by user, with
//!   validated health transitions and synchronous health observers
//! - [`router::EventRouter`]: sequences events per thread, resolves the
//!   owner's connections, and hard-fails on cross-user delivery
//! - [`broadcast::BroadcastService`]: one writer per connection, bounded
//!   sends with retry, reroute to backup on failure
//! - [`failover::FailoverCoordinator`]: primary to backup redirection,
//!   revert on recovery, offline buffering
//! - [`heartbeat`]: per-connection liveness monitor
//! - [`engine::RelayEngine`]: wires everything from `EngineOptions`

#![deny(unsafe_code)]

pub mod broadcast;
pub mod connection;
pub mod engine;
pub mod failover;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod transport;

pub use broadcast::BroadcastService;
pub use connection::{ClientConnection, ConnectionRegistration, ConnectionSnapshot, HealthMetrics};
pub use engine::{ConnectionHandle, EngineError, EngineStatus, RelayEngine};
pub use failover::{FailoverCoordinator, FailoverRecord, OfflineBuffer};
pub use heartbeat::{HeartbeatConfig, HeartbeatResult, run_heartbeat};
pub use registry::{ConnectionRegistry, HealthObserver};
pub use router::{EventRouter, RouterStats};
pub use transport::{ChannelTransport, Transport};
