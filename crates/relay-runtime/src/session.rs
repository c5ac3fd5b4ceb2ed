//! One user's agent session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::ids::{SessionId, UserId};
use relay_core::sink::EventSink;
use relay_core::telemetry::MetricsSink;
use serde::Serialize;
use tracing::{debug, info};

use crate::agent::{Agent, AgentCatalog, AgentInit, AgentKind};
use crate::bridge::AgentBridge;
use crate::context::ExecutionContextFactory;
use crate::errors::SessionError;

/// Agent instances, context factory, and bridge of one user.
pub struct AgentSession {
    user_id: UserId,
    session_id: SessionId,
    contexts: Arc<ExecutionContextFactory>,
    bridge: Arc<AgentBridge>,
    agents: Mutex<HashMap<AgentKind, Arc<dyn Agent>>>,
    created_at: DateTime<Utc>,
}

/// Summary returned by session cleanup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupMetrics {
    /// Owner of the released session.
    pub user_id: UserId,
    /// Released session.
    pub session_id: SessionId,
    /// Agent instances shut down.
    pub agents_released: usize,
    /// Live execution contexts torn down.
    pub contexts_torn_down: usize,
    /// Threads whose routing state was released.
    pub threads_released: usize,
    /// Events routed through the bridge over the session's life.
    pub events_emitted: u64,
    /// Session age at cleanup, in milliseconds.
    pub session_age_ms: u64,
    /// When cleanup ran.
    pub cleaned_at: DateTime<Utc>,
}

impl AgentSession {
    /// Create a session with its own context factory and bridge.
    pub fn new(
        user_id: UserId,
        sink: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let session_id = SessionId::new();
        let contexts = Arc::new(ExecutionContextFactory::new(
            user_id.clone(),
            session_id.clone(),
        ));
        let bridge = Arc::new(AgentBridge::new(
            Arc::clone(&contexts),
            session_id.clone(),
            sink,
            metrics,
        ));
        Self {
            user_id,
            session_id,
            contexts,
            bridge,
            agents: Mutex::new(HashMap::new()),
            created_at: Utc::now(),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Session ID.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// This session's context factory.
    pub fn contexts(&self) -> &Arc<ExecutionContextFactory> {
        &self.contexts
    }

    /// This session's outbound bridge.
    pub fn bridge(&self) -> &Arc<AgentBridge> {
        &self.bridge
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last emit through the bridge or agent lookup.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.bridge.last_activity()
    }

    /// Record activity.
    pub fn touch(&self) {
        self.bridge.touch();
    }

    /// Whether the session has seen no activity for longer than `max_idle`.
    pub fn idle_longer_than(&self, max_idle: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_activity());
        idle.to_std().is_ok_and(|d| d > max_idle)
    }

    /// Kinds instantiated so far.
    pub fn agent_kinds(&self) -> Vec<AgentKind> {
        let agents = self.agents.lock();
        AgentKind::ALL
            .into_iter()
            .filter(|k| agents.contains_key(k))
            .collect()
    }

    /// The instance of `kind`, built from `catalog` on first request.
    pub fn agent(
        &self,
        kind: AgentKind,
        catalog: &AgentCatalog,
    ) -> Result<Arc<dyn Agent>, SessionError> {
        if self.bridge.is_closed() {
            return Err(SessionError::SessionClosed(self.user_id.clone()));
        }
        self.touch();
        let mut agents = self.agents.lock();
        if let Some(existing) = agents.get(&kind) {
            return Ok(Arc::clone(existing));
        }
        let instance = catalog
            .build(AgentInit {
                user_id: self.user_id.clone(),
                kind,
                bridge: Arc::clone(&self.bridge),
            })
            .ok_or(SessionError::AgentNotRegistered(kind))?;
        if instance.user_id() != &self.user_id {
            return Err(relay_core::errors::IsolationViolation {
                requester: instance.user_id().clone(),
                owner: self.user_id.clone(),
                resource: format!("{kind} agent slot"),
            }
            .into());
        }
        let _ = agents.insert(kind, Arc::clone(&instance));
        debug!(user_id = %self.user_id, %kind, "agent instantiated");
        Ok(instance)
    }

    /// Close the bridge, tear down contexts, shut down agents, then release
    /// the routing state of every thread the session ran on.
    pub async fn release(&self) -> CleanupMetrics {
        self.bridge.close();
        self.bridge.quiesce().await;
        let threads = self.contexts.threads();
        let contexts_torn_down = self.contexts.teardown_all();
        let agents: Vec<_> = self.agents.lock().drain().map(|(_, a)| a).collect();
        for agent in &agents {
            agent.shutdown().await;
        }
        self.bridge.release_threads(&threads).await;
        let cleaned_at = Utc::now();
        let age = cleaned_at
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default();
        let metrics = CleanupMetrics {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            agents_released: agents.len(),
            contexts_torn_down,
            threads_released: threads.len(),
            events_emitted: self.bridge.emitted_count(),
            session_age_ms: age.as_millis() as u64,
            cleaned_at,
        };
        info!(
            user_id = %metrics.user_id,
            agents = metrics.agents_released,
            contexts = metrics.contexts_torn_down,
            events = metrics.events_emitted,
            "session released"
        );
        metrics
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("agents", &self.agent_kinds())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
