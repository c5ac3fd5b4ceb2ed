//! Per-user agent session registry.
//!
//! Sessions are keyed by the owning user's ID and held in a registry object
//! the host constructs and injects. Two users never receive the same
//! session, context factory, bridge, or agent instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use relay_core::ids::UserId;
use relay_core::sink::EventSink;
use relay_core::telemetry::{self, MetricsSink};
use tracing::{info, instrument};

use crate::agent::{Agent, AgentCatalog, AgentKind};
use crate::errors::SessionError;
use crate::session::{AgentSession, CleanupMetrics};

/// Owns every live [`AgentSession`], one per user.
pub struct AgentSessionRegistry {
    sessions: DashMap<UserId, Arc<AgentSession>>,
    catalog: AgentCatalog,
    sink: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl AgentSessionRegistry {
    /// Create an empty registry. Every session's bridge routes into `sink`.
    pub fn new(
        catalog: AgentCatalog,
        sink: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            catalog,
            sink,
            metrics,
        }
    }

    /// The user's session, created on first call.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub fn create_session(&self, user_id: &UserId) -> Arc<AgentSession> {
        let entry = self.sessions.entry(user_id.clone()).or_insert_with(|| {
            self.metrics.increment(
                telemetry::SESSIONS_CREATED,
                &[("user_id", user_id.to_string())],
            );
            info!("agent session created");
            Arc::new(AgentSession::new(
                user_id.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.metrics),
            ))
        });
        Arc::clone(entry.value())
    }

    /// The user's session, if one is live.
    pub fn get_session(&self, user_id: &UserId) -> Option<Arc<AgentSession>> {
        self.sessions.get(user_id).map(|s| Arc::clone(s.value()))
    }

    /// The user's instance of `kind`, built on first request.
    pub fn get_user_agent(
        &self,
        user_id: &UserId,
        kind: AgentKind,
    ) -> Result<Arc<dyn Agent>, SessionError> {
        let session = self
            .get_session(user_id)
            .ok_or_else(|| SessionError::SessionNotFound(user_id.clone()))?;
        session.agent(kind, &self.catalog)
    }

    /// Remove and release the user's session.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn cleanup_session(&self, user_id: &UserId) -> Result<CleanupMetrics, SessionError> {
        let (_, session) = self
            .sessions
            .remove(user_id)
            .ok_or_else(|| SessionError::SessionNotFound(user_id.clone()))?;
        let metrics = session.release().await;
        self.metrics.increment(
            telemetry::SESSIONS_CLEANED,
            &[("user_id", user_id.to_string())],
        );
        Ok(metrics)
    }

    /// Release every session idle for longer than `max_idle`.
    pub async fn cleanup_inactive(&self, max_idle: Duration) -> Vec<CleanupMetrics> {
        let now = Utc::now();
        let idle: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_longer_than(max_idle, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = Vec::with_capacity(idle.len());
        for user_id in idle {
            // A concurrent cleanup may have taken it already.
            if let Ok(metrics) = self.cleanup_session(&user_id).await {
                released.push(metrics);
            }
        }
        if !released.is_empty() {
            info!(count = released.len(), "idle sessions released");
        }
        released
    }

    /// Release every session.
    pub async fn cleanup_all(&self) -> Vec<CleanupMetrics> {
        let users: Vec<UserId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut released = Vec::with_capacity(users.len());
        for user_id in users {
            if let Ok(metrics) = self.cleanup_session(&user_id).await {
                released.push(metrics);
            }
        }
        released
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// The agent catalog sessions build from.
    pub fn catalog(&self) -> &AgentCatalog {
        &self.catalog
    }
}

impl std::fmt::Debug for AgentSessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}
