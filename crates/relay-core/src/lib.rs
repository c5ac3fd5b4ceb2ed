//! # relay-core
//!
//! Foundation types shared by every relay crate:
//!
//! - **Branded IDs**: `UserId`, `ConnectionId`, `ThreadId`, `RunId`, ... as newtypes
//! - **Events**: [`events::EventType`] lifecycle kinds, the caller-side
//!   [`events::EmitRequest`] and the router-stamped [`events::Event`]
//! - **Health**: the connection status state machine and connection roles
//! - **Errors**: registry, delivery, and routing failures via `thiserror`, with
//!   [`errors::IsolationViolation`] kept as its own type
//! - **Telemetry**: the [`telemetry::MetricsSink`] seam and metric names
//! - **Sink**: the [`sink::EventSink`] trait an agent bridge routes through
//! - **Logging**: `tracing-subscriber` initialization

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod health;
pub mod ids;
pub mod logging;
pub mod sink;
pub mod telemetry;

pub use errors::{DeliveryError, IsolationViolation, RegistryError, RouteError};
pub use events::{EmitRequest, Event, EventType};
pub use health::{ConnectionRole, ConnectionStatus};
pub use ids::{ConnectionId, RequestId, RunId, SessionId, ThreadId, UserId};
pub use sink::{ConnectionDelivery, DeliveryOutcome, DeliveryStatus, EventSink};
pub use telemetry::{FacadeMetrics, InMemoryMetrics, MetricSample, MetricsSink};
