//! # relay-runtime
//!
//! Per-user execution isolation for agent runs.
//!
//! - [`registry::AgentSessionRegistry`]: one [`session::AgentSession`] per user,
//!   created on first use and destroyed on cleanup
//! - [`context::ExecutionContextFactory`]: owned by a session, produces one
//!   [`context::UserExecutionContext`] per (user, thread) run
//! - [`bridge::AgentBridge`]: the only path from an agent to the event router
//! - [`agent::AgentCatalog`]: registration table of agent constructors keyed
//!   by [`agent::AgentKind`]
//!
//! Nothing here is stored in process-wide state. Every table is keyed by the
//! owning user's ID and lives inside an injectable object.

#![deny(unsafe_code)]

pub mod agent;
pub mod bridge;
pub mod context;
pub mod errors;
pub mod registry;
pub mod session;

pub use agent::{Agent, AgentCatalog, AgentInit, AgentKind};
pub use bridge::AgentBridge;
pub use context::{ContextRequest, ExecutionContextFactory, UserExecutionContext};
pub use errors::SessionError;
pub use registry::AgentSessionRegistry;
pub use session::{AgentSession, CleanupMetrics};
