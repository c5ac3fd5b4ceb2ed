//! Execution contexts and the per-user factory that owns them.
//!
//! A [`UserExecutionContext`] is created for exactly one (user, thread, run)
//! and handed out as `Arc<UserExecutionContext>`. The type is not `Clone`, so
//! the only way to hold one is through the factory that created it. Each
//! [`ExecutionContextFactory`] is owned by a single user's session; there is
//! no shared factory.
//!
//! Only the last retired run of each thread is remembered. Older runs are
//! still refused through their context handles, which are no longer live.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::errors::{IsolationViolation, RouteError};
use relay_core::ids::{ConnectionId, RequestId, RunId, SessionId, ThreadId, UserId};
use serde_json::{Map, Value};
use tokio::sync::MutexGuard;
use tracing::debug;

use crate::errors::SessionError;

/// Everything a caller supplies to start a run on a thread.
#[derive(Clone, Debug)]
pub struct ContextRequest {
    /// Thread the run belongs to.
    pub thread_id: ThreadId,
    /// The run.
    pub run_id: RunId,
    /// Client request that started the run.
    pub request_id: RequestId,
    /// Connection that issued the request, if targeting it is desired.
    pub connection_id: Option<ConnectionId>,
    /// Free-form metadata carried on the context.
    pub metadata: Map<String, Value>,
}

impl ContextRequest {
    /// Request with fresh run and request IDs and no target connection.
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            run_id: RunId::new(),
            request_id: RequestId::new(),
            connection_id: None,
            metadata: Map::new(),
        }
    }
}

/// Isolated state for one user's run on one thread.
#[derive(Debug)]
pub struct UserExecutionContext {
    user_id: UserId,
    session_id: SessionId,
    thread_id: ThreadId,
    run_id: RunId,
    request_id: RequestId,
    connection_id: Option<ConnectionId>,
    metadata: Map<String, Value>,
    created_at: DateTime<Utc>,
    /// Serializes emits of the run so a terminal event is the last one routed.
    emit_gate: tokio::sync::Mutex<()>,
}

impl UserExecutionContext {
    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Session that created the context.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Thread of the run.
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// The run.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request that started the run.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Connection the run's events target, if pinned.
    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Caller-supplied metadata.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Wait for the run's in-flight emit, then hold off later ones.
    pub(crate) async fn lock_emits(&self) -> MutexGuard<'_, ()> {
        self.emit_gate.lock().await
    }
}

/// Produces and tracks the execution contexts of one user.
#[derive(Debug)]
pub struct ExecutionContextFactory {
    user_id: UserId,
    session_id: SessionId,
    live: Mutex<HashMap<ThreadId, Arc<UserExecutionContext>>>,
    /// Last retired run per thread.
    retired_runs: Mutex<HashMap<ThreadId, RunId>>,
}

impl ExecutionContextFactory {
    /// Create a factory bound to one user's session.
    pub fn new(user_id: UserId, session_id: SessionId) -> Self {
        Self {
            user_id,
            session_id,
            live: Mutex::new(HashMap::new()),
            retired_runs: Mutex::new(HashMap::new()),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Create the context for a run, or return the live one if the same run
    /// asks again.
    pub fn create_context(
        &self,
        request: ContextRequest,
    ) -> Result<Arc<UserExecutionContext>, SessionError> {
        if self.is_retired(&request.run_id) {
            return Err(SessionError::RunRetired(request.run_id));
        }
        let mut live = self.live.lock();
        if let Some(existing) = live.get(&request.thread_id) {
            if existing.run_id == request.run_id {
                return Ok(Arc::clone(existing));
            }
            return Err(SessionError::ThreadBusy {
                thread_id: request.thread_id,
                active_run: existing.run_id.clone(),
            });
        }
        let context = Arc::new(UserExecutionContext {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            thread_id: request.thread_id.clone(),
            run_id: request.run_id,
            request_id: request.request_id,
            connection_id: request.connection_id,
            metadata: request.metadata,
            created_at: Utc::now(),
            emit_gate: tokio::sync::Mutex::new(()),
        });
        let _ = live.insert(request.thread_id, Arc::clone(&context));
        debug!(user_id = %self.user_id, thread_id = %context.thread_id, run_id = %context.run_id, "execution context created");
        Ok(context)
    }

    /// The live context of a thread.
    pub fn context(&self, thread_id: &ThreadId) -> Option<Arc<UserExecutionContext>> {
        self.live.lock().get(thread_id).cloned()
    }

    /// Remove a thread's context and retire its run ID.
    pub fn teardown(&self, thread_id: &ThreadId) -> Option<Arc<UserExecutionContext>> {
        let removed = self.live.lock().remove(thread_id)?;
        let _ = self
            .retired_runs
            .lock()
            .insert(thread_id.clone(), removed.run_id.clone());
        debug!(user_id = %self.user_id, %thread_id, run_id = %removed.run_id, "execution context torn down");
        Some(removed)
    }

    /// Tear down every live context. Returns how many were removed.
    pub fn teardown_all(&self) -> usize {
        let drained: Vec<_> = self.live.lock().drain().collect();
        let mut retired = self.retired_runs.lock();
        for (thread_id, ctx) in &drained {
            let _ = retired.insert(thread_id.clone(), ctx.run_id.clone());
        }
        drained.len()
    }

    /// Whether the run is the last one retired on its thread.
    pub fn is_retired(&self, run_id: &RunId) -> bool {
        self.retired_runs.lock().values().any(|r| r == run_id)
    }

    /// Live contexts, in no particular order.
    pub fn live_contexts(&self) -> Vec<Arc<UserExecutionContext>> {
        self.live.lock().values().cloned().collect()
    }

    /// Every thread this factory has run on, live or retired.
    pub fn threads(&self) -> Vec<ThreadId> {
        let mut threads: Vec<ThreadId> = self.live.lock().keys().cloned().collect();
        for thread_id in self.retired_runs.lock().keys() {
            if !threads.contains(thread_id) {
                threads.push(thread_id.clone());
            }
        }
        threads
    }

    /// Number of live contexts.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Check that `context` belongs to this factory's user and is still the
    /// live context of its thread.
    pub fn validate(&self, context: &UserExecutionContext) -> Result<(), RouteError> {
        if context.user_id != self.user_id {
            return Err(IsolationViolation {
                requester: context.user_id.clone(),
                owner: self.user_id.clone(),
                resource: format!("execution context factory of session {}", self.session_id),
            }
            .into());
        }
        if self.is_retired(&context.run_id) {
            return Err(RouteError::StaleRun(context.run_id.clone()));
        }
        match self.live.lock().get(&context.thread_id) {
            Some(live) if std::ptr::eq(Arc::as_ptr(live), context) => Ok(()),
            _ => Err(RouteError::StaleRun(context.run_id.clone())),
        }
    }
}
