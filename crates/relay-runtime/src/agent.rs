//! Agent kinds and the constructor table.
//!
//! The set of agent types is a closed enum. Which kinds a deployment can
//! instantiate is decided by what is registered in the [`AgentCatalog`];
//! sessions build instances lazily from it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::ids::UserId;

use crate::bridge::AgentBridge;

/// Agent types a session can host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Coordinates the other agents of a run.
    Supervisor,
    /// Classifies incoming requests.
    Triage,
    /// Gathers data for the supervisor.
    Research,
    /// Runs tool calls.
    Tooling,
    /// Produces the final report.
    Reporting,
}

impl AgentKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Supervisor,
        Self::Triage,
        Self::Research,
        Self::Tooling,
        Self::Reporting,
    ];

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Triage => "triage",
            Self::Research => "research",
            Self::Tooling => "tooling",
            Self::Reporting => "reporting",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An agent instance owned by one user's session.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Which kind this instance is.
    fn kind(&self) -> AgentKind;

    /// The user whose session owns this instance.
    fn user_id(&self) -> &UserId;

    /// Release resources. Called once during session cleanup, after the
    /// bridge is closed.
    async fn shutdown(&self) {}
}

/// Everything a constructor receives. The bridge is the instance's only
/// route to connections.
pub struct AgentInit {
    /// Owning user.
    pub user_id: UserId,
    /// Kind being built.
    pub kind: AgentKind,
    /// The owning session's outbound bridge.
    pub bridge: Arc<AgentBridge>,
}

/// Builds an agent instance.
pub type AgentConstructor = Arc<dyn Fn(AgentInit) -> Arc<dyn Agent> + Send + Sync>;

/// Registration table of agent constructors.
#[derive(Clone, Default)]
pub struct AgentCatalog {
    constructors: HashMap<AgentKind, AgentConstructor>,
}

impl AgentCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: AgentKind, constructor: F)
    where
        F: Fn(AgentInit) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        let _ = self.constructors.insert(kind, Arc::new(constructor));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with<F>(mut self, kind: AgentKind, constructor: F) -> Self
    where
        F: Fn(AgentInit) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.register(kind, constructor);
        self
    }

    /// Whether `kind` has a constructor.
    pub fn contains(&self, kind: AgentKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<AgentKind> {
        AgentKind::ALL
            .into_iter()
            .filter(|k| self.contains(*k))
            .collect()
    }

    /// Build an instance, or `None` if `init.kind` is not registered.
    pub fn build(&self, init: AgentInit) -> Option<Arc<dyn Agent>> {
        let constructor = self.constructors.get(&init.kind)?;
        Some(constructor(init))
    }
}

impl fmt::Debug for AgentCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCatalog")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
impl fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("kind", &self.kind())
            .field("user_id", &self.user_id())
            .finish()
    }
}
