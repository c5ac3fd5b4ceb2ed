//! The outbound bridge from a session's agents to the event router.
//!
//! Agents never see a connection. They hand the bridge their execution
//! context and an event kind; the bridge stamps ownership from the context,
//! checks the context is still live, and forwards to the [`EventSink`].
//! Emits of one run are routed one at a time, so nothing follows a
//! terminal event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::errors::{IsolationViolation, RouteError};
use relay_core::events::{EmitRequest, EventType};
use relay_core::ids::{SessionId, ThreadId, UserId};
use relay_core::sink::{DeliveryOutcome, EventSink};
use relay_core::telemetry::{self, MetricsSink};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::context::{ExecutionContextFactory, UserExecutionContext};

/// Per-session bridge. Exactly one exists per [`AgentSession`](crate::AgentSession).
pub struct AgentBridge {
    user_id: UserId,
    session_id: SessionId,
    contexts: Arc<ExecutionContextFactory>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    closed: AtomicBool,
    emitted: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
}

impl AgentBridge {
    /// Create a bridge for one user's session.
    pub fn new(
        contexts: Arc<ExecutionContextFactory>,
        session_id: SessionId,
        sink: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            user_id: contexts.user_id().clone(),
            session_id,
            contexts,
            sink,
            metrics,
            closed: AtomicBool::new(false),
            emitted: AtomicU64::new(0),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The session's context factory.
    pub fn contexts(&self) -> &Arc<ExecutionContextFactory> {
        &self.contexts
    }

    /// Emit one lifecycle event for the run held by `context`.
    ///
    /// Emits of the same run wait for each other. A terminal event tears the
    /// context down after routing, whatever the routing result, so emits
    /// queued behind it fail with `StaleRun`.
    #[instrument(skip_all, fields(user_id = %self.user_id, thread_id = %context.thread_id(), event_type = %event_type))]
    pub async fn emit(
        &self,
        context: &UserExecutionContext,
        event_type: EventType,
        payload: Value,
    ) -> Result<DeliveryOutcome, RouteError> {
        self.touch();
        let _gate = context.lock_emits().await;
        if self.is_closed() {
            return Err(RouteError::SessionClosed(self.user_id.clone()));
        }
        if let Err(e) = self.contexts.validate(context) {
            self.record_rejection(&e);
            return Err(e);
        }

        let request = EmitRequest {
            user_id: context.user_id().clone(),
            thread_id: context.thread_id().clone(),
            run_id: context.run_id().clone(),
            request_id: context.request_id().clone(),
            connection_id: context.connection_id().cloned(),
            event_type,
            payload,
        };
        let result = self.sink.route(request).await;

        if event_type.is_terminal() {
            let _ = self.contexts.teardown(context.thread_id());
        }
        self.touch();
        match &result {
            Ok(outcome) => {
                let _ = self.emitted.fetch_add(1, Ordering::Relaxed);
                debug!(sequence_no = outcome.sequence_no(), delivered = outcome.delivered_count(), "event emitted");
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "emit rejected by router");
            }
            Err(e) => {
                debug!(error = %e, category = e.category(), "emit not delivered");
            }
        }
        result
    }

    /// Emit without surfacing operational failures.
    ///
    /// Agents use this on their hot path: an offline user or a retired run
    /// never blocks the agent. Isolation violations still propagate.
    pub async fn notify(
        &self,
        context: &UserExecutionContext,
        event_type: EventType,
        payload: Value,
    ) -> Result<(), IsolationViolation> {
        match self.emit(context, event_type, payload).await {
            Ok(_) => Ok(()),
            Err(RouteError::Isolation(v)) => Err(v),
            Err(_) => Ok(()),
        }
    }

    /// Stop accepting events. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(user_id = %self.user_id, session_id = %self.session_id, "bridge closed");
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Events routed successfully through this bridge.
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Last emit, or agent lookup, on this session.
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Record activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Wait for in-flight emits of the session's live runs to finish. Call
    /// after [`close`](Self::close) so nothing new starts.
    pub async fn quiesce(&self) {
        for context in self.contexts.live_contexts() {
            drop(context.lock_emits().await);
        }
    }

    /// Release the sink's state for threads this session ran on.
    pub async fn release_threads(&self, threads: &[ThreadId]) {
        for thread_id in threads {
            self.sink.release_thread(&self.user_id, thread_id).await;
        }
    }

    fn record_rejection(&self, e: &RouteError) {
        let tags = [("user_id", self.user_id.to_string())];
        match e {
            RouteError::Isolation(v) => {
                error!(violation = %v, "context from another user reached this bridge");
                self.metrics.increment(telemetry::ISOLATION_VIOLATIONS, &tags);
            }
            RouteError::StaleRun(run_id) => {
                warn!(%run_id, "emit for retired run rejected");
                self.metrics.increment(telemetry::STALE_RUN_REJECTIONS, &tags);
            }
            other => warn!(error = %other, "emit rejected"),
        }
    }
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .field("emitted", &self.emitted_count())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_core::ids::{RunId, ThreadId};
    use relay_core::telemetry::InMemoryMetrics;
    use serde_json::json;

    use super::test_support::{RecordingSink, SinkHold};
    use super::*;
    use crate::context::ContextRequest;

    fn bridge(user: &str) -> (AgentBridge, Arc<RecordingSink>, Arc<InMemoryMetrics>) {
        let sink = Arc::new(RecordingSink::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let session_id = SessionId::new();
        let contexts = Arc::new(ExecutionContextFactory::new(
            UserId::from(user),
            session_id.clone(),
        ));
        let bridge = AgentBridge::new(contexts, session_id, sink.clone(), metrics.clone());
        (bridge, sink, metrics)
    }

    fn start(bridge: &AgentBridge, thread: &str) -> Arc<UserExecutionContext> {
        bridge
            .contexts()
            .create_context(ContextRequest::new(ThreadId::from(thread)))
            .unwrap()
    }

    #[tokio::test]
    async fn canonical_run_routes_in_order() {
        let (bridge, sink, _) = bridge("alice");
        let ctx = start(&bridge, "t1");
        for event_type in EventType::CANONICAL {
            let outcome = bridge.emit(&ctx, event_type, json!({})).await.unwrap();
            assert_eq!(outcome.event.user_id().as_str(), "alice");
        }
        assert_eq!(sink.types(), EventType::CANONICAL.to_vec());
        let seqs: Vec<_> = sink.events.lock().iter().map(|e| e.sequence_no()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(bridge.emitted_count(), 5);
    }

    #[tokio::test]
    async fn terminal_event_retires_run() {
        let (bridge, sink, metrics) = bridge("alice");
        let ctx = start(&bridge, "t1");
        let _ = bridge.emit(&ctx, EventType::AgentStarted, Value::Null).await.unwrap();
        let _ = bridge.emit(&ctx, EventType::AgentCancelled, Value::Null).await.unwrap();

        let err = bridge
            .emit(&ctx, EventType::AgentThinking, Value::Null)
            .await
            .unwrap_err();
        assert_matches!(err, RouteError::StaleRun(_));
        assert_eq!(sink.events.lock().len(), 2);
        assert_eq!(metrics.total(telemetry::STALE_RUN_REJECTIONS), 1.0);
        assert!(bridge.contexts().context(&ThreadId::from("t1")).is_none());
    }

    #[tokio::test]
    async fn nothing_follows_a_terminal_event() {
        let hold = SinkHold::default();
        let sink = Arc::new(RecordingSink {
            hold: Some(hold.clone()),
            ..RecordingSink::default()
        });
        let session_id = SessionId::new();
        let contexts = Arc::new(ExecutionContextFactory::new(
            UserId::from("alice"),
            session_id.clone(),
        ));
        let bridge = Arc::new(AgentBridge::new(
            contexts,
            session_id,
            sink.clone(),
            Arc::new(InMemoryMetrics::new()),
        ));
        let ctx = start(&bridge, "t1");

        let completing = {
            let (bridge, ctx) = (Arc::clone(&bridge), Arc::clone(&ctx));
            tokio::spawn(async move { bridge.emit(&ctx, EventType::AgentCompleted, Value::Null).await })
        };
        // The terminal event is now inside the router.
        hold.entered.acquire().await.unwrap().forget();

        let late = {
            let (bridge, ctx) = (Arc::clone(&bridge), Arc::clone(&ctx));
            tokio::spawn(async move { bridge.emit(&ctx, EventType::AgentThinking, Value::Null).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        hold.release.add_permits(2);

        assert!(completing.await.unwrap().is_ok());
        assert_matches!(late.await.unwrap(), Err(RouteError::StaleRun(_)));
        assert_eq!(sink.types(), [EventType::AgentCompleted]);
    }

    #[tokio::test]
    async fn emits_refresh_activity() {
        let (bridge, _, _) = bridge("alice");
        let ctx = start(&bridge, "t1");
        let before = bridge.last_activity();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let _ = bridge.emit(&ctx, EventType::AgentStarted, Value::Null).await.unwrap();
        assert!(bridge.last_activity() > before);
    }

    #[tokio::test]
    async fn foreign_context_is_isolation_violation() {
        let (alice, alice_sink, metrics) = bridge("alice");
        let (bob, _, _) = bridge("bob");
        let bobs_ctx = start(&bob, "t1");

        let err = alice
            .emit(&bobs_ctx, EventType::AgentStarted, Value::Null)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(alice_sink.events.lock().is_empty());
        assert_eq!(metrics.total(telemetry::ISOLATION_VIOLATIONS), 1.0);

        let v = alice
            .notify(&bobs_ctx, EventType::AgentStarted, Value::Null)
            .await
            .unwrap_err();
        assert_eq!(v.requester.as_str(), "bob");
    }

    #[tokio::test]
    async fn notify_absorbs_operational_failures() {
        let (bridge, _, _) = bridge("alice");
        let ctx = start(&bridge, "t1");
        bridge.notify(&ctx, EventType::AgentError, Value::Null).await.unwrap();
        // Retired run: swallowed.
        bridge.notify(&ctx, EventType::AgentThinking, Value::Null).await.unwrap();
        assert_eq!(bridge.emitted_count(), 1);
    }

    #[tokio::test]
    async fn closed_bridge_rejects() {
        let (bridge, sink, _) = bridge("alice");
        let ctx = start(&bridge, "t1");
        bridge.close();
        bridge.close();
        assert!(bridge.is_closed());
        assert_matches!(
            bridge.emit(&ctx, EventType::AgentStarted, Value::Null).await,
            Err(RouteError::SessionClosed(u)) if u.as_str() == "alice"
        );
        assert!(sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn pinned_connection_travels_on_request() {
        let (bridge, sink, _) = bridge("alice");
        let ctx = bridge
            .contexts()
            .create_context(ContextRequest {
                connection_id: Some("c9".into()),
                run_id: RunId::from("r1"),
                ..ContextRequest::new(ThreadId::from("t1"))
            })
            .unwrap();
        let _ = bridge.emit(&ctx, EventType::AgentStarted, Value::Null).await.unwrap();
        let events = sink.events.lock();
        assert_eq!(events[0].connection_id().map(|c| c.as_str()), Some("c9"));
        assert_eq!(events[0].run_id().as_str(), "r1");
    }
}
