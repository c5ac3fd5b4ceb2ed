//! Shared helpers for engine integration tests.

#![allow(dead_code, missing_docs)]

use std::sync::Arc;

use relay_core::ids::{ThreadId, UserId};
use relay_core::telemetry::InMemoryMetrics;
use relay_runtime::{
    Agent, AgentCatalog, AgentKind, AgentSession, ContextRequest, UserExecutionContext,
};
use relay_server::RelayEngine;
use relay_settings::EngineOptions;
use serde_json::Value;
use tokio::sync::mpsc;

/// An agent that only remembers who owns it.
pub struct EchoAgent {
    user_id: UserId,
    kind: AgentKind,
}

#[async_trait::async_trait]
impl Agent for EchoAgent {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

pub fn catalog() -> AgentCatalog {
    AgentKind::ALL.into_iter().fold(AgentCatalog::new(), |catalog, kind| {
        catalog.with(kind, |init| {
            Arc::new(EchoAgent {
                user_id: init.user_id,
                kind: init.kind,
            })
        })
    })
}

pub struct Harness {
    pub engine: RelayEngine,
    pub metrics: Arc<InMemoryMetrics>,
}

pub fn harness() -> Harness {
    harness_with(EngineOptions::default())
}

pub fn harness_with(options: EngineOptions) -> Harness {
    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = RelayEngine::new(options, catalog(), metrics.clone()).unwrap();
    Harness { engine, metrics }
}

/// Open a session for `user` and a fresh run on `thread`.
pub fn start_run(
    engine: &RelayEngine,
    user: &str,
    thread: &str,
) -> (Arc<AgentSession>, Arc<UserExecutionContext>) {
    let session = engine.create_session(&UserId::from(user));
    let ctx = session
        .contexts()
        .create_context(ContextRequest::new(ThreadId::from(thread)))
        .unwrap();
    (session, ctx)
}

/// Everything currently queued on a connection channel, parsed.
pub fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(serde_json::from_str(&msg).unwrap());
    }
    out
}

pub fn types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["type"].as_str().unwrap_or_default().to_owned())
        .collect()
}

pub fn sequence_numbers(events: &[Value]) -> Vec<u64> {
    events
        .iter()
        .map(|e| e["sequenceNo"].as_u64().unwrap_or_default())
        .collect()
}

pub fn user(id: &str) -> UserId {
    UserId::from(id)
}
