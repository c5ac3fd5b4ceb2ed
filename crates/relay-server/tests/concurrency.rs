//! Multi-tenant load: many users emitting at once.

#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{drain, harness, sequence_numbers, start_run};
use relay_core::events::EventType;
use relay_core::telemetry;
use relay_server::ConnectionRegistration;
use serde_json::json;

const USERS: usize = 10;
const EVENTS_PER_USER: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_users_fifty_events_each() {
    let h = Arc::new(harness());
    let mut receivers = Vec::with_capacity(USERS);
    for u in 0..USERS {
        let handle = h
            .engine
            .connect(ConnectionRegistration::primary(format!("conn-{u}"), format!("user-{u}")))
            .await
            .unwrap();
        receivers.push(handle.receiver);
    }

    let mut tasks = Vec::with_capacity(USERS);
    for u in 0..USERS {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            let user = format!("user-{u}");
            let (session, ctx) = start_run(&h.engine, &user, &format!("thread-{u}"));
            for i in 0..EVENTS_PER_USER {
                let event_type = if i == 0 {
                    EventType::AgentStarted
                } else {
                    EventType::AgentThinking
                };
                session
                    .bridge()
                    .notify(&ctx, event_type, json!({"owner": user, "i": i}))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut delivered = 0;
    for (u, rx) in receivers.iter_mut().enumerate() {
        let events = drain(rx);
        let owner = format!("user-{u}");
        // 100% isolation.
        assert!(
            events
                .iter()
                .all(|e| e["userId"] == owner.as_str() && e["payload"]["owner"] == owner.as_str()),
            "foreign event on {owner}'s connection"
        );
        // Per-thread order holds under load.
        let seqs = sequence_numbers(&events);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "out of order for {owner}: {seqs:?}");
        delivered += events.len();
    }

    let expected = USERS * EVENTS_PER_USER;
    assert!(
        delivered * 100 >= expected * 95,
        "delivery rate too low: {delivered}/{expected}"
    );
    assert_eq!(h.engine.router().stats().isolation_violations, 0);
    assert_eq!(h.metrics.total(telemetry::ISOLATION_VIOLATIONS), 0.0);

    let mean = h.metrics.mean(telemetry::ROUTING_LATENCY_MS).unwrap();
    assert!(mean < 100.0, "mean routing latency {mean:.2}ms");
}
