//! Load harness for the relay engine.
//!
//! Produces a JSON report for:
//! - many users emitting concurrently, one connection each
//! - one user fanned out to several connections
//! - a primary failing mid-run with a backup taking over

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::events::EventType;
use relay_core::health::ConnectionStatus;
use relay_core::ids::{ConnectionId, UserId};
use relay_core::telemetry::{FacadeMetrics, MetricsSink};
use relay_runtime::{AgentCatalog, ContextRequest};
use relay_server::{ConnectionRegistration, RelayEngine};
use relay_settings::EngineOptions;
use serde::Serialize;
use serde_json::{Value, json};
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SCENARIOS: [&str; 3] = ["multi_tenant", "fan_out", "failover"];

#[derive(Debug, Parser)]
#[command(
    name = "relay-bench",
    about = "Load harness for per-user event delivery"
)]
struct Args {
    /// Scenario to run: `multi_tenant`, `fan_out`, `failover`, `all`.
    #[arg(long, default_value = "all")]
    scenario: String,

    /// Concurrent users for `multi_tenant`.
    #[arg(long, default_value_t = 10)]
    users: usize,

    /// Events emitted per user.
    #[arg(long, default_value_t = 50)]
    events: usize,

    /// Connections for the `fan_out` user.
    #[arg(long, default_value_t = 4)]
    connections: usize,

    /// Optional engine options file (JSON, merged over defaults).
    #[arg(long)]
    options: Option<PathBuf>,

    /// Optional output path for the JSON report.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Fail unless every scenario delivers >= 95%, keeps mean routing
    /// latency under 100 ms, and shows no foreign events.
    #[arg(long, default_value_t = false)]
    enforce_gates: bool,

    /// Install the Prometheus recorder and include its text output in the report.
    #[arg(long, default_value_t = false)]
    prometheus: bool,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Serialize)]
struct Report {
    generated_at: String,
    options: EngineOptions,
    scenarios: Vec<ScenarioResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prometheus: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScenarioResult {
    name: String,
    users: usize,
    events_emitted: usize,
    expected_deliveries: usize,
    deliveries: usize,
    delivery_rate: f64,
    route_errors: usize,
    foreign_events: usize,
    isolation_violations: u64,
    failovers: usize,
    latency_ms: LatencyStats,
    peak_memory_bytes: u64,
}

#[derive(Debug, Serialize)]
struct LatencyStats {
    p50: f64,
    p95: f64,
    mean: f64,
    min: f64,
    max: f64,
}

/// Messages received on one connection, with the user that owns it.
struct Collector {
    owner: String,
    handle: JoinHandle<Vec<Arc<String>>>,
}

impl Collector {
    fn spawn(owner: &str, mut rx: mpsc::Receiver<Arc<String>>) -> Self {
        let handle = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(msg) = rx.recv().await {
                received.push(msg);
            }
            received
        });
        Self {
            owner: owner.to_string(),
            handle,
        }
    }

    /// Wait for the channel to close. Returns (received, foreign).
    async fn finish(self) -> Result<(usize, usize)> {
        let received = self.handle.await.context("collector task panicked")?;
        let mut foreign = 0;
        for msg in &received {
            let event: Value = serde_json::from_str(msg).context("undecodable event")?;
            if event["userId"] != self.owner.as_str() {
                foreign += 1;
            }
        }
        Ok((received.len(), foreign))
    }
}

#[derive(Default)]
struct EmitTally {
    latencies_ms: Vec<f64>,
    route_errors: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    relay_core::logging::init_subscriber(&args.log_level);
    let names = scenario_names(&args.scenario)?;

    let options = match &args.options {
        Some(path) => relay_settings::load_options_from_path(path)
            .with_context(|| format!("failed to load options: {}", path.display()))?,
        None => relay_settings::load_options().context("failed to load options")?,
    };
    let prometheus = if args.prometheus {
        Some(relay_server::metrics::install_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let mut results = Vec::with_capacity(names.len());
    for name in names {
        info!(scenario = name, users = args.users, events = args.events, "scenario started");
        let started = Instant::now();
        let result = match name {
            "multi_tenant" => run_multi_tenant(&options, args.users, args.events).await?,
            "fan_out" => run_fan_out(&options, args.connections, args.events).await?,
            "failover" => run_failover(&options, args.events).await?,
            _ => unreachable!("validated scenario name"),
        };
        info!(
            scenario = name,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            delivery_rate = result.delivery_rate,
            route_errors = result.route_errors,
            "scenario finished"
        );
        results.push(result);
    }

    let report = Report {
        generated_at: chrono::Utc::now().to_rfc3339(),
        options,
        scenarios: results,
        prometheus: prometheus.as_ref().map(relay_server::metrics::render),
    };

    let failures = gate_failures(&report);
    for failure in &failures {
        warn!(%failure, "gate failed");
    }

    let encoded = serde_json::to_string_pretty(&report)?;
    if let Some(path) = args.output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create report dir: {}", parent.display())
            })?;
        }
        std::fs::write(&path, &encoded)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        println!("{}", path.display());
    } else {
        println!("{encoded}");
    }

    if args.enforce_gates && !failures.is_empty() {
        anyhow::bail!("{} benchmark gate(s) failed", failures.len());
    }
    Ok(())
}

fn scenario_names(name: &str) -> Result<Vec<&'static str>> {
    if name == "all" {
        return Ok(SCENARIOS.to_vec());
    }
    match SCENARIOS.iter().find(|s| **s == name) {
        Some(s) => Ok(vec![*s]),
        None => anyhow::bail!("unknown scenario: {name}"),
    }
}

fn build_engine(options: &EngineOptions) -> Result<RelayEngine> {
    let metrics: Arc<dyn MetricsSink> = Arc::new(FacadeMetrics);
    RelayEngine::new(options.clone(), AgentCatalog::new(), metrics).context("failed to build engine")
}

/// Emit `count` events for `user` on one run, timing each emit.
async fn emit_run(engine: &RelayEngine, user: &str, thread: &str, count: usize) -> Result<EmitTally> {
    let session = engine.create_session(&UserId::from(user));
    let ctx = session
        .contexts()
        .create_context(ContextRequest::new(thread.into()))?;
    let mut tally = EmitTally {
        latencies_ms: Vec::with_capacity(count),
        route_errors: 0,
    };
    for i in 0..count {
        let event_type = match i {
            0 => EventType::AgentStarted,
            _ if i + 1 == count => EventType::AgentCompleted,
            _ if i % 2 == 0 => EventType::ToolExecuting,
            _ => EventType::AgentThinking,
        };
        let start = Instant::now();
        let result = session
            .bridge()
            .emit(&ctx, event_type, json!({"owner": user, "i": i}))
            .await;
        tally.latencies_ms.push(start.elapsed().as_secs_f64() * 1000.0);
        match result {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e).context("isolation violation during benchmark"),
            Err(_) => tally.route_errors += 1,
        }
    }
    Ok(tally)
}

async fn run_multi_tenant(options: &EngineOptions, users: usize, events: usize) -> Result<ScenarioResult> {
    let engine = Arc::new(build_engine(options)?);
    let peak_memory = Arc::new(AtomicU64::new(current_process_memory_bytes()));

    let mut collectors = Vec::with_capacity(users);
    for u in 0..users {
        let user = format!("user-{u}");
        let handle = engine
            .connect(ConnectionRegistration::primary(format!("conn-{u}"), user.as_str()))
            .await?;
        collectors.push(Collector::spawn(&user, handle.receiver));
    }

    let mut workers = Vec::with_capacity(users);
    for u in 0..users {
        let engine = Arc::clone(&engine);
        let peak = Arc::clone(&peak_memory);
        workers.push(tokio::spawn(async move {
            let tally = emit_run(&engine, &format!("user-{u}"), &format!("thread-{u}"), events).await;
            sample_peak_memory(&peak);
            tally
        }));
    }
    let mut tally = EmitTally::default();
    for worker in workers {
        let t = worker.await.context("emitter task panicked")??;
        tally.latencies_ms.extend(t.latencies_ms);
        tally.route_errors += t.route_errors;
    }

    for u in 0..users {
        let _ = engine.unregister_connection(&ConnectionId::from(format!("conn-{u}")))?;
    }
    let (deliveries, foreign) = finish_all(collectors).await?;
    let _ = engine.shutdown().await;

    Ok(scenario_result(
        "multi_tenant",
        &engine,
        users,
        users * events,
        users * events,
        deliveries,
        foreign,
        0,
        tally,
        peak_memory.load(Ordering::Relaxed),
    ))
}

async fn run_fan_out(options: &EngineOptions, connections: usize, events: usize) -> Result<ScenarioResult> {
    let engine = build_engine(options)?;
    let peak_memory = AtomicU64::new(current_process_memory_bytes());

    let mut collectors = Vec::with_capacity(connections);
    for c in 0..connections {
        let handle = engine
            .connect(ConnectionRegistration::primary(format!("device-{c}"), "fan-user"))
            .await?;
        collectors.push(Collector::spawn("fan-user", handle.receiver));
    }
    let tally = emit_run(&engine, "fan-user", "fan-thread", events).await?;
    sample_peak_memory(&peak_memory);

    for c in 0..connections {
        let _ = engine.unregister_connection(&ConnectionId::from(format!("device-{c}")))?;
    }
    let (deliveries, foreign) = finish_all(collectors).await?;
    let _ = engine.shutdown().await;

    Ok(scenario_result(
        "fan_out",
        &engine,
        1,
        events,
        events * connections,
        deliveries,
        foreign,
        0,
        tally,
        peak_memory.load(Ordering::Relaxed),
    ))
}

async fn run_failover(options: &EngineOptions, events: usize) -> Result<ScenarioResult> {
    let engine = build_engine(options)?;
    let peak_memory = AtomicU64::new(current_process_memory_bytes());
    let user = "failover-user";

    let primary = engine
        .connect(ConnectionRegistration::primary("primary", user))
        .await?;
    let backup = engine
        .connect(ConnectionRegistration::backup("backup", user))
        .await?;
    let bystander = engine
        .connect(ConnectionRegistration::primary("bystander", "other-user"))
        .await?;
    let collectors = vec![
        Collector::spawn(user, primary.receiver),
        Collector::spawn(user, backup.receiver),
        Collector::spawn("other-user", bystander.receiver),
    ];

    let first_half = events / 2;
    let mut tally = emit_run(&engine, user, "failover-thread-1", first_half).await?;
    let _ = engine
        .mark_health(&ConnectionId::from("primary"), ConnectionStatus::Disconnected)
        .await?;
    let rest = emit_run(&engine, user, "failover-thread-2", events - first_half).await?;
    tally.latencies_ms.extend(rest.latencies_ms);
    tally.route_errors += rest.route_errors;
    sample_peak_memory(&peak_memory);

    for id in ["primary", "backup", "bystander"] {
        let _ = engine.unregister_connection(&ConnectionId::from(id))?;
    }
    let (deliveries, foreign) = finish_all(collectors).await?;
    let failovers = engine
        .coordinator()
        .failover_history(&UserId::from(user))
        .len();
    let _ = engine.shutdown().await;

    Ok(scenario_result(
        "failover",
        &engine,
        1,
        events,
        events,
        deliveries,
        foreign,
        failovers,
        tally,
        peak_memory.load(Ordering::Relaxed),
    ))
}

async fn finish_all(collectors: Vec<Collector>) -> Result<(usize, usize)> {
    let mut deliveries = 0;
    let mut foreign = 0;
    for collector in collectors {
        let (received, wrong_owner) = collector.finish().await?;
        deliveries += received;
        foreign += wrong_owner;
    }
    Ok((deliveries, foreign))
}

#[allow(clippy::too_many_arguments)]
fn scenario_result(
    name: &str,
    engine: &RelayEngine,
    users: usize,
    events_emitted: usize,
    expected_deliveries: usize,
    deliveries: usize,
    foreign_events: usize,
    failovers: usize,
    tally: EmitTally,
    peak_memory_bytes: u64,
) -> ScenarioResult {
    #[allow(clippy::cast_precision_loss)]
    let delivery_rate = if expected_deliveries == 0 {
        1.0
    } else {
        deliveries as f64 / expected_deliveries as f64
    };
    ScenarioResult {
        name: name.to_string(),
        users,
        events_emitted,
        expected_deliveries,
        deliveries,
        delivery_rate,
        route_errors: tally.route_errors,
        foreign_events,
        isolation_violations: engine.router().stats().isolation_violations,
        failovers,
        latency_ms: summarize_latencies(&tally.latencies_ms),
        peak_memory_bytes,
    }
}

fn gate_failures(report: &Report) -> Vec<String> {
    let mut failures = Vec::new();
    for s in &report.scenarios {
        if s.delivery_rate < 0.95 {
            failures.push(format!("{}: delivery rate {:.3} < 0.95", s.name, s.delivery_rate));
        }
        if s.latency_ms.mean >= 100.0 {
            failures.push(format!("{}: mean latency {:.2}ms >= 100ms", s.name, s.latency_ms.mean));
        }
        if s.foreign_events > 0 || s.isolation_violations > 0 {
            failures.push(format!(
                "{}: {} foreign events, {} isolation violations",
                s.name, s.foreign_events, s.isolation_violations
            ));
        }
    }
    failures
}

fn summarize_latencies(latencies_ms: &[f64]) -> LatencyStats {
    if latencies_ms.is_empty() {
        return LatencyStats {
            p50: 0.0,
            p95: 0.0,
            mean: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }

    let mut sorted = latencies_ms.to_vec();
    sorted.sort_by(f64::total_cmp);
    let len = sorted.len();
    #[allow(clippy::cast_precision_loss)]
    let mean = sorted.iter().sum::<f64>() / len as f64;

    LatencyStats {
        p50: sorted[percentile_index(len, 0.50)],
        p95: sorted[percentile_index(len, 0.95)],
        mean,
        min: sorted[0],
        max: sorted[len - 1],
    }
}

fn percentile_index(len: usize, percentile: f64) -> usize {
    if len <= 1 {
        return 0;
    }
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let rank = ((len - 1) as f64 * percentile).round() as usize;
    rank.min(len - 1)
}

fn current_process_memory_bytes() -> u64 {
    let mut system = System::new();
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let _ = system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map_or(0, sysinfo::Process::memory)
}

fn sample_peak_memory(peak: &AtomicU64) {
    let current = current_process_memory_bytes();
    let mut observed = peak.load(Ordering::Relaxed);
    while current > observed {
        match peak.compare_exchange_weak(observed, current, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(next) => observed = next,
        }
    }
}
