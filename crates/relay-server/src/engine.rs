//! `RelayEngine`: the assembled delivery and isolation engine.
//!
//! Builds the connection registry, failover coordinator, broadcast service,
//! router, and agent session registry from one `EngineOptions` value and
//! wires them together. Nothing is global; hosts hold the engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_core::errors::RegistryError;
use relay_core::health::ConnectionStatus;
use relay_core::ids::{ConnectionId, ThreadId, UserId};
use relay_core::sink::EventSink;
use relay_core::telemetry::MetricsSink;
use relay_runtime::{AgentCatalog, AgentSession, AgentSessionRegistry, CleanupMetrics, SessionError};
use relay_settings::{EngineOptions, SettingsError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastService;
use crate::connection::{ClientConnection, ConnectionRegistration};
use crate::failover::FailoverCoordinator;
use crate::heartbeat::{HeartbeatConfig, HeartbeatResult, run_heartbeat};
use crate::registry::ConnectionRegistry;
use crate::router::{EventRouter, RouterStats};
use crate::transport::{ChannelTransport, Transport};

/// How long shutdown waits for heartbeat monitors to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connection registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Options failed validation.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// The engine sends through a host transport and has no in-process
    /// channels to hand out.
    #[error("in-process channels unavailable: engine uses a host transport")]
    ChannelsUnavailable,
}

/// A connection registered through [`RelayEngine::connect`] and the
/// receiving end of its in-process channel.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// The registered connection.
    pub connection: Arc<ClientConnection>,
    /// Serialized events delivered to the connection.
    pub receiver: mpsc::Receiver<Arc<String>>,
}

/// Point-in-time engine status.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    /// `"ok"`, or `"shutting_down"` once [`RelayEngine::shutdown`] ran.
    pub status: &'static str,
    /// Seconds since the engine was built.
    pub uptime_secs: u64,
    /// Registered connections.
    pub connections: usize,
    /// Users with at least one connection.
    pub connected_users: usize,
    /// Live agent sessions.
    pub active_sessions: usize,
    /// Router counters.
    pub router: RouterStats,
}

/// The engine.
pub struct RelayEngine {
    options: EngineOptions,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<FailoverCoordinator>,
    broadcast: Arc<BroadcastService>,
    router: Arc<EventRouter>,
    sessions: AgentSessionRegistry,
    channels: Option<Arc<ChannelTransport>>,
    heartbeats: TaskTracker,
    heartbeat_tokens: DashMap<ConnectionId, CancellationToken>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl RelayEngine {
    /// Build an engine that delivers over in-process channels
    /// (see [`connect`](Self::connect)).
    pub fn new(
        options: EngineOptions,
        catalog: AgentCatalog,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, EngineError> {
        options.validate()?;
        let channels = Arc::new(ChannelTransport::new(options.connection_channel_capacity));
        let transport: Arc<dyn Transport> = channels.clone();
        Ok(Self::assemble(options, catalog, transport, Some(channels), metrics))
    }

    /// Build an engine that delivers through a host transport.
    pub fn with_transport(
        options: EngineOptions,
        catalog: AgentCatalog,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, EngineError> {
        options.validate()?;
        Ok(Self::assemble(options, catalog, transport, None, metrics))
    }

    fn assemble(
        options: EngineOptions,
        catalog: AgentCatalog,
        transport: Arc<dyn Transport>,
        channels: Option<Arc<ChannelTransport>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            options.registry_shards,
            Arc::clone(&metrics),
        ));
        let coordinator = Arc::new(FailoverCoordinator::new(
            Arc::clone(&registry),
            &options,
            Arc::clone(&metrics),
        ));
        registry.add_observer(coordinator.clone());
        let broadcast = Arc::new(BroadcastService::new(
            transport,
            Arc::clone(&coordinator),
            &options,
            Arc::clone(&metrics),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&broadcast),
            Arc::clone(&coordinator),
            Arc::clone(&metrics),
        ));
        let sink: Arc<dyn EventSink> = router.clone();
        let sessions = AgentSessionRegistry::new(catalog, sink, metrics);
        info!(
            shards = options.registry_shards,
            failover = options.failover_enabled,
            channels = channels.is_some(),
            "relay engine ready"
        );
        Self {
            options,
            registry,
            coordinator,
            broadcast,
            router,
            sessions,
            channels,
            heartbeats: TaskTracker::new(),
            heartbeat_tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    // ── Connections ─────────────────────────────────────────────────────

    /// Register a connection in `connecting` state. The host marks it active
    /// once its handshake completes.
    pub fn register_connection(
        &self,
        registration: ConnectionRegistration,
    ) -> Result<Arc<ClientConnection>, EngineError> {
        Ok(self.registry.register(registration)?)
    }

    /// Register a connection backed by an in-process channel, mark it
    /// active, and flush anything held for its user.
    pub async fn connect(
        &self,
        registration: ConnectionRegistration,
    ) -> Result<ConnectionHandle, EngineError> {
        let channels = self
            .channels
            .as_ref()
            .ok_or(EngineError::ChannelsUnavailable)?;
        let connection_id = registration.connection_id.clone();
        if self.registry.get(&connection_id).is_some() {
            return Err(RegistryError::DuplicateConnection(connection_id).into());
        }
        let receiver = channels.attach(connection_id.clone());
        let connection = match self.registry.register(registration) {
            Ok(c) => c,
            Err(e) => {
                let _ = channels.detach(&connection_id);
                return Err(e.into());
            }
        };
        let _ = self.mark_health(&connection_id, ConnectionStatus::Active).await?;
        Ok(ConnectionHandle {
            connection,
            receiver,
        })
    }

    /// Remove a connection: stop its heartbeat, drop its delivery cursor,
    /// and detach its channel.
    pub fn unregister_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Arc<ClientConnection>, EngineError> {
        if let Some((_, token)) = self.heartbeat_tokens.remove(connection_id) {
            token.cancel();
        }
        let removed = self.registry.unregister(connection_id)?;
        self.broadcast.forget_connection(connection_id);
        if let Some(channels) = &self.channels {
            let _ = channels.detach(connection_id);
        }
        Ok(removed)
    }

    /// Apply a health transition. Returns the previous status. A connection
    /// becoming active flushes its user's held events.
    pub async fn mark_health(
        &self,
        connection_id: &ConnectionId,
        status: ConnectionStatus,
    ) -> Result<ConnectionStatus, EngineError> {
        let previous = self.registry.mark_health(connection_id, status)?;
        if status == ConnectionStatus::Active && previous != ConnectionStatus::Active {
            if let Some(connection) = self.registry.get(connection_id) {
                let flushed = self.router.flush_offline(connection.user_id()).await;
                if flushed > 0 {
                    debug!(%connection_id, flushed, "held events delivered on activation");
                }
            }
        }
        Ok(previous)
    }

    /// Subscribe a connection to a thread.
    pub fn bind_thread(
        &self,
        connection_id: &ConnectionId,
        thread_id: ThreadId,
    ) -> Result<(), EngineError> {
        Ok(self.registry.bind_thread(connection_id, thread_id)?)
    }

    /// Record a pong from the client.
    pub fn record_pong(&self, connection_id: &ConnectionId) -> Result<(), EngineError> {
        Ok(self.registry.touch(connection_id)?)
    }

    /// Wait, up to `handshake_timeout_ms`, for a connection to leave
    /// `connecting`.
    pub async fn wait_for_handshake(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<ConnectionStatus, EngineError> {
        Ok(self
            .registry
            .wait_for_handshake(connection_id, self.options.handshake_timeout())
            .await?)
    }

    /// Start the heartbeat monitor for a connection. It stops when the
    /// connection times out or is unregistered, or on [`shutdown`](Self::shutdown).
    ///
    /// The monitor also flushes the user's held events whenever the
    /// connection becomes active, including a heartbeat-driven recovery from
    /// `degraded`.
    pub fn spawn_heartbeat(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<JoinHandle<HeartbeatResult>, EngineError> {
        let connection = self
            .registry
            .get(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.clone()))?;
        let cancel = self.shutdown.child_token();
        if let Some(previous) = self
            .heartbeat_tokens
            .insert(connection_id.clone(), cancel.clone())
        {
            previous.cancel();
        }
        let registry = Arc::clone(&self.registry);
        let router = Arc::clone(&self.router);
        let config = HeartbeatConfig::from_options(&self.options);
        Ok(self.heartbeats.spawn(async move {
            let id = connection.id().clone();
            let user_id = connection.user_id().clone();
            let mut status = connection.subscribe_status();
            let mut last = *status.borrow_and_update();
            let heartbeat = run_heartbeat(connection, registry, config, cancel);
            tokio::pin!(heartbeat);
            let result = loop {
                tokio::select! {
                    result = &mut heartbeat => break result,
                    Ok(()) = status.changed() => {
                        let current = *status.borrow_and_update();
                        if current == ConnectionStatus::Active && last != ConnectionStatus::Active {
                            let flushed = router.flush_offline(&user_id).await;
                            if flushed > 0 {
                                debug!(connection_id = %id, flushed, "held events delivered on recovery");
                            }
                        }
                        last = current;
                    }
                }
            };
            debug!(connection_id = %id, ?result, "heartbeat stopped");
            result
        }))
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// The user's agent session, created on first call.
    pub fn create_session(&self, user_id: &UserId) -> Arc<AgentSession> {
        self.sessions.create_session(user_id)
    }

    /// Remove and release the user's agent session.
    pub async fn cleanup_session(&self, user_id: &UserId) -> Result<CleanupMetrics, SessionError> {
        self.sessions.cleanup_session(user_id).await
    }

    /// Drop the routing state of a finished thread. Session cleanup does
    /// this for every thread the session ran on.
    pub async fn forget_thread(&self, user_id: &UserId, thread_id: &ThreadId) -> bool {
        self.router.forget_thread(user_id, thread_id).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Stop every heartbeat monitor and release every agent session.
    pub async fn shutdown(&self) -> Vec<CleanupMetrics> {
        self.shutdown.cancel();
        let _ = self.heartbeats.close();
        info!(task_count = self.heartbeats.len(), "waiting for heartbeat monitors");
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.heartbeats.wait()).await.is_err() {
            warn!("shutdown timed out after {SHUTDOWN_TIMEOUT:?}, some monitors may still be running");
        }
        self.heartbeat_tokens.clear();
        let released = self.sessions.cleanup_all().await;
        info!(sessions = released.len(), "relay engine shut down");
        released
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Point-in-time status.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            status: if self.is_shutting_down() { "shutting_down" } else { "ok" },
            uptime_secs: self.start_time.elapsed().as_secs(),
            connections: self.registry.connection_count(),
            connected_users: self.registry.user_count(),
            active_sessions: self.sessions.active_sessions(),
            router: self.router.stats(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// The event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// The agent session registry.
    pub fn sessions(&self) -> &AgentSessionRegistry {
        &self.sessions
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The failover coordinator.
    pub fn coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.coordinator
    }

    /// The broadcast service.
    pub fn broadcast(&self) -> &Arc<BroadcastService> {
        &self.broadcast
    }

    /// Options the engine was built with.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use relay_core::events::{EmitRequest, Event, EventType};
    use relay_core::ids::{RequestId, RunId};
    use relay_core::telemetry::InMemoryMetrics;
    use relay_runtime::ContextRequest;
    use serde_json::{Value, json};

    use super::*;

    fn engine() -> RelayEngine {
        RelayEngine::new(
            EngineOptions::default(),
            AgentCatalog::new(),
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = EngineOptions {
            registry_shards: 0,
            ..EngineOptions::default()
        };
        let result = RelayEngine::new(options, AgentCatalog::new(), Arc::new(InMemoryMetrics::new()));
        assert_matches!(result, Err(EngineError::Settings(_)));
    }

    #[tokio::test]
    async fn session_emit_reaches_connection() {
        let engine = engine();
        let mut handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        assert_eq!(handle.connection.status(), ConnectionStatus::Active);

        let session = engine.create_session(&UserId::from("alice"));
        let ctx = session
            .contexts()
            .create_context(ContextRequest::new(ThreadId::from("t1")))
            .unwrap();
        for event_type in EventType::CANONICAL {
            let _ = session
                .bridge()
                .emit(&ctx, event_type, json!({"step": event_type.as_str()}))
                .await
                .unwrap();
        }
        let got: Vec<_> = drain(&mut handle.receiver)
            .iter()
            .map(|e| e["type"].as_str().unwrap().to_owned())
            .collect();
        let want: Vec<_> = EventType::CANONICAL.iter().map(|t| t.as_str().to_owned()).collect();
        assert_eq!(got, want);
        assert_eq!(engine.status().router.routed, 5);
    }

    #[tokio::test]
    async fn duplicate_connect_keeps_first_channel() {
        let engine = engine();
        let mut first = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        assert_matches!(
            engine.connect(ConnectionRegistration::primary("c1", "alice")).await,
            Err(EngineError::Registry(RegistryError::DuplicateConnection(_)))
        );
        let session = engine.create_session(&UserId::from("alice"));
        let ctx = session
            .contexts()
            .create_context(ContextRequest::new(ThreadId::from("t1")))
            .unwrap();
        let _ = session
            .bridge()
            .emit(&ctx, EventType::AgentStarted, Value::Null)
            .await
            .unwrap();
        assert_eq!(drain(&mut first.receiver).len(), 1);
    }

    #[tokio::test]
    async fn host_transport_has_no_channels() {
        let engine = RelayEngine::with_transport(
            EngineOptions::default(),
            AgentCatalog::new(),
            Arc::new(ChannelTransport::new(4)),
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap();
        assert_matches!(
            engine.connect(ConnectionRegistration::primary("c1", "alice")).await,
            Err(EngineError::ChannelsUnavailable)
        );
        let conn = engine
            .register_connection(ConnectionRegistration::primary("c1", "alice"))
            .unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn held_events_flush_on_activation() {
        let engine = engine();
        let alice = UserId::from("alice");
        let session = engine.create_session(&alice);
        let ctx = session
            .contexts()
            .create_context(ContextRequest::new(ThreadId::from("t1")))
            .unwrap();
        // Nobody connected: the bridge swallows the non-fatal error.
        session
            .bridge()
            .notify(&ctx, EventType::AgentStarted, Value::Null)
            .await
            .unwrap();
        assert_eq!(engine.coordinator().buffer().pending(&alice), 1);

        let mut handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let got = drain(&mut handle.receiver);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "agent_started");
        assert_eq!(got[0]["sequenceNo"], 1);
        assert!(!engine.coordinator().buffer().has_pending(&alice));
    }

    #[tokio::test]
    async fn unregister_detaches_channel() {
        let engine = engine();
        let mut handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let removed = engine.unregister_connection(&ConnectionId::from("c1")).unwrap();
        assert_eq!(removed.status(), ConnectionStatus::Terminated);
        assert!(handle.receiver.recv().await.is_none());
        assert_matches!(
            engine.unregister_connection(&ConnectionId::from("c1")),
            Err(EngineError::Registry(RegistryError::UnknownConnection(_)))
        );
        assert_eq!(engine.status().connections, 0);
    }

    #[tokio::test]
    async fn handshake_wait_resolves_on_activation() {
        let engine = Arc::new(engine());
        let _ = engine
            .register_connection(ConnectionRegistration::primary("c1", "alice"))
            .unwrap();
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.wait_for_handshake(&ConnectionId::from("c1")).await })
        };
        tokio::task::yield_now().await;
        let _ = engine
            .mark_health(&ConnectionId::from("c1"), ConnectionStatus::Active)
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ConnectionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_wait_times_out() {
        let engine = engine();
        let _ = engine
            .register_connection(ConnectionRegistration::primary("c1", "alice"))
            .unwrap();
        assert_matches!(
            engine.wait_for_handshake(&ConnectionId::from("c1")).await,
            Err(EngineError::Registry(RegistryError::HandshakeTimeout(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_fails_over() {
        let options = EngineOptions {
            heartbeat_interval_ms: 100,
            ..EngineOptions::default()
        };
        let engine = RelayEngine::new(options, AgentCatalog::new(), Arc::new(InMemoryMetrics::new()))
            .unwrap();
        let primary = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let _backup = engine
            .connect(ConnectionRegistration::backup("c2", "alice"))
            .await
            .unwrap();
        let _ = primary.connection.check_alive();

        let heartbeat = engine.spawn_heartbeat(&ConnectionId::from("c1")).unwrap();
        assert_eq!(heartbeat.await.unwrap(), HeartbeatResult::TimedOut);
        assert_eq!(primary.connection.status(), ConnectionStatus::Disconnected);
        let record = engine
            .coordinator()
            .active_failover(&ConnectionId::from("c1"))
            .unwrap();
        assert_eq!(record.backup_connection_id.as_str(), "c2");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_recovery_flushes_held_events() {
        let options = EngineOptions {
            heartbeat_interval_ms: 100,
            ..EngineOptions::default()
        };
        let engine = RelayEngine::new(options, AgentCatalog::new(), Arc::new(InMemoryMetrics::new()))
            .unwrap();
        let alice = UserId::from("alice");
        let c1 = ConnectionId::from("c1");
        let mut handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let _ = engine.mark_health(&c1, ConnectionStatus::Degraded).await.unwrap();
        let held = Event::stamp(
            EmitRequest {
                user_id: alice.clone(),
                thread_id: ThreadId::from("t1"),
                run_id: RunId::from("r1"),
                request_id: RequestId::from("q1"),
                connection_id: None,
                event_type: EventType::AgentThinking,
                payload: Value::Null,
            },
            1,
        );
        let _ = engine.coordinator().hold(Arc::new(held));
        engine.record_pong(&c1).unwrap();

        let heartbeat = engine.spawn_heartbeat(&c1).unwrap();
        for _ in 0..10 {
            if !engine.coordinator().buffer().has_pending(&alice) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.connection.status(), ConnectionStatus::Active);
        assert!(!engine.coordinator().buffer().has_pending(&alice));
        let got = drain(&mut handle.receiver);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "agent_thinking");

        let _ = engine.unregister_connection(&c1).unwrap();
        let _ = heartbeat.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_heartbeats_and_releases_sessions() {
        let engine = engine();
        let _handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let heartbeat = engine.spawn_heartbeat(&ConnectionId::from("c1")).unwrap();
        let session = engine.create_session(&UserId::from("alice"));

        let released = tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(heartbeat.await.unwrap(), HeartbeatResult::Cancelled);
        assert!(session.bridge().is_closed());
        assert_eq!(engine.status().status, "shutting_down");
    }

    #[tokio::test]
    async fn unregister_cancels_heartbeat() {
        let engine = engine();
        let _handle = engine
            .connect(ConnectionRegistration::primary("c1", "alice"))
            .await
            .unwrap();
        let heartbeat = engine.spawn_heartbeat(&ConnectionId::from("c1")).unwrap();
        let _ = engine.unregister_connection(&ConnectionId::from("c1")).unwrap();
        let result = heartbeat.await.unwrap();
        assert!(matches!(
            result,
            HeartbeatResult::Cancelled | HeartbeatResult::Terminated
        ));
    }
}
