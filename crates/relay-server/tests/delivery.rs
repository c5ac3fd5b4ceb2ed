//! Ordering and completeness of lifecycle events.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{drain, harness, sequence_numbers, start_run, types};
use relay_core::errors::RouteError;
use relay_core::events::EventType;
use relay_core::ids::{ConnectionId, ThreadId};
use relay_runtime::ContextRequest;
use relay_server::ConnectionRegistration;
use serde_json::{Value, json};

#[tokio::test]
async fn canonical_run_arrives_complete_and_in_order() {
    let h = harness();
    let mut conn = h
        .engine
        .connect(ConnectionRegistration::primary("c1", "alice"))
        .await
        .unwrap();
    let (session, ctx) = start_run(&h.engine, "alice", "t1");
    for event_type in EventType::CANONICAL {
        let _ = session
            .bridge()
            .emit(&ctx, event_type, json!({"at": event_type.as_str()}))
            .await
            .unwrap();
    }

    let events = drain(&mut conn.receiver);
    assert_eq!(
        types(&events),
        [
            "agent_started",
            "agent_thinking",
            "tool_executing",
            "tool_completed",
            "agent_completed"
        ]
    );
    assert_eq!(sequence_numbers(&events), [1, 2, 3, 4, 5]);
    assert!(events.iter().all(|e| e["runId"] == ctx.run_id().as_str()));
}

#[tokio::test]
async fn every_connection_of_the_user_gets_the_same_order() {
    let h = harness();
    let mut desktop = h
        .engine
        .connect(ConnectionRegistration::primary("desktop", "alice"))
        .await
        .unwrap();
    let mut phone = h
        .engine
        .connect(ConnectionRegistration::primary("phone", "alice"))
        .await
        .unwrap();
    let (session, ctx) = start_run(&h.engine, "alice", "t1");
    for event_type in EventType::CANONICAL {
        let _ = session.bridge().emit(&ctx, event_type, Value::Null).await.unwrap();
    }
    let a = drain(&mut desktop.receiver);
    let b = drain(&mut phone.receiver);
    assert_eq!(sequence_numbers(&a), [1, 2, 3, 4, 5]);
    assert_eq!(sequence_numbers(&a), sequence_numbers(&b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_emitters_on_one_thread_never_invert() {
    let h = Arc::new(harness());
    let mut conn = h
        .engine
        .connect(ConnectionRegistration::primary("c1", "alice"))
        .await
        .unwrap();
    let (session, ctx) = start_run(&h.engine, "alice", "t1");

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = Arc::clone(&session);
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let _ = session
                    .bridge()
                    .emit(&ctx, EventType::AgentThinking, Value::Null)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let seqs = sequence_numbers(&drain(&mut conn.receiver));
    assert_eq!(seqs, (1..=80).collect::<Vec<_>>());
}

#[tokio::test]
async fn terminal_event_retires_the_run() {
    let h = harness();
    let mut conn = h
        .engine
        .connect(ConnectionRegistration::primary("c1", "alice"))
        .await
        .unwrap();
    let (session, ctx) = start_run(&h.engine, "alice", "t1");
    let _ = session
        .bridge()
        .emit(&ctx, EventType::AgentCompleted, Value::Null)
        .await
        .unwrap();
    assert!(session.contexts().context(&ThreadId::from("t1")).is_none());

    assert_matches!(
        session.bridge().emit(&ctx, EventType::AgentThinking, Value::Null).await,
        Err(RouteError::StaleRun(run)) if &run == ctx.run_id()
    );
    assert_eq!(drain(&mut conn.receiver).len(), 1);

    // A new run on the same thread continues the thread's sequence.
    let next = session
        .contexts()
        .create_context(ContextRequest::new(ThreadId::from("t1")))
        .unwrap();
    let outcome = session
        .bridge()
        .emit(&next, EventType::AgentStarted, Value::Null)
        .await
        .unwrap();
    assert_eq!(outcome.sequence_no(), 2);
}

#[tokio::test]
async fn thread_bound_connection_only_sees_its_thread() {
    let h = harness();
    let mut all = h
        .engine
        .connect(ConnectionRegistration::primary("all", "alice"))
        .await
        .unwrap();
    let mut focused = h
        .engine
        .connect(ConnectionRegistration::primary("focused", "alice"))
        .await
        .unwrap();
    h.engine
        .bind_thread(&ConnectionId::from("focused"), ThreadId::from("t2"))
        .unwrap();

    let session = h.engine.create_session(&common::user("alice"));
    for thread in ["t1", "t2"] {
        let ctx = session
            .contexts()
            .create_context(ContextRequest::new(ThreadId::from(thread)))
            .unwrap();
        let _ = session
            .bridge()
            .emit(&ctx, EventType::AgentStarted, Value::Null)
            .await
            .unwrap();
    }
    assert_eq!(drain(&mut all.receiver).len(), 2);
    let only = drain(&mut focused.receiver);
    assert_eq!(only.len(), 1);
    assert_eq!(only[0]["threadId"], "t2");
}
