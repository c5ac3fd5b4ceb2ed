//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use relay_core::health::ConnectionStatus;
use relay_settings::EngineOptions;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::ClientConnection;
use crate::registry::ConnectionRegistry;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding and was marked disconnected.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
    /// The connection was unregistered.
    Terminated,
}

/// Heartbeat thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between checks.
    pub interval: Duration,
    /// Consecutive misses before `degraded`.
    pub degraded_after: u32,
    /// Consecutive misses before `disconnected`.
    pub max_missed: u32,
}

impl HeartbeatConfig {
    /// Thresholds from engine options.
    pub fn from_options(options: &EngineOptions) -> Self {
        Self {
            interval: options.heartbeat_interval(),
            degraded_after: options.heartbeat_degraded_after,
            max_missed: options.heartbeat_max_missed.max(1),
        }
    }
}

/// Run heartbeat checks for a connection.
///
/// At each `interval` tick the alive flag is checked and reset. A miss
/// increments the counter; at `degraded_after` misses an active connection is
/// marked degraded, and at `max_missed` it is marked disconnected and the loop
/// returns [`HeartbeatResult::TimedOut`]. A pong while degraded restores
/// `active`. Transitions go through the registry so observers see them.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    registry: Arc<ConnectionRegistry>,
    config: HeartbeatConfig,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(config.interval);
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                let status = connection.status();
                if status == ConnectionStatus::Terminated {
                    return HeartbeatResult::Terminated;
                }
                if connection.check_alive() {
                    missed_pongs = 0;
                    connection.set_missed_heartbeats(0);
                    if status == ConnectionStatus::Degraded {
                        let _ = registry.mark_health(connection.id(), ConnectionStatus::Active);
                    }
                    continue;
                }
                missed_pongs += 1;
                connection.set_missed_heartbeats(missed_pongs);
                debug!(connection_id = %connection.id(), missed_pongs, "heartbeat missed");
                if missed_pongs >= config.max_missed {
                    let _ = registry.mark_health(connection.id(), ConnectionStatus::Disconnected);
                    return HeartbeatResult::TimedOut;
                }
                if missed_pongs >= config.degraded_after && status == ConnectionStatus::Active {
                    let _ = registry.mark_health(connection.id(), ConnectionStatus::Degraded);
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistration;
    use relay_core::telemetry::InMemoryMetrics;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<ClientConnection>) {
        let registry = Arc::new(ConnectionRegistry::new(1, Arc::new(InMemoryMetrics::new())));
        let conn = registry
            .register(ConnectionRegistration::primary("hb_conn", "alice"))
            .unwrap();
        let _ = registry.mark_health(conn.id(), ConnectionStatus::Active).unwrap();
        (registry, conn)
    }

    fn config(interval_ms: u64, degraded_after: u32, max_missed: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(interval_ms),
            degraded_after,
            max_missed,
        }
    }

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let (registry, conn) = setup();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat(conn, registry, config(100_000, 1, 3), cancel2).await
        });

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_degrades_then_disconnects() {
        let (registry, conn) = setup();
        let _ = conn.check_alive();
        let mut status = conn.subscribe_status();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            registry,
            config(100, 1, 3),
            CancellationToken::new(),
        ));

        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Degraded);

        assert_eq!(handle.await.unwrap(), HeartbeatResult::TimedOut);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.health_metrics().missed_heartbeats, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_restores_degraded_connection() {
        let (registry, conn) = setup();
        let _ = conn.check_alive();
        let mut status = conn.subscribe_status();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            registry,
            config(100, 1, 5),
            cancel.clone(),
        ));

        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Degraded);
        conn.mark_alive();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Active);
        assert_eq!(conn.health_metrics().missed_heartbeats, 0);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn alive_connection_stays_active() {
        let (registry, conn) = setup();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            registry,
            config(50, 1, 3),
            cancel.clone(),
        ));

        // Pong halfway between ticks.
        time::sleep(Duration::from_millis(25)).await;
        for _ in 0..10 {
            conn.mark_alive();
            time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(conn.status(), ConnectionStatus::Active);
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_connection_stops_monitor() {
        let (registry, conn) = setup();
        let handle = tokio::spawn(run_heartbeat(
            Arc::clone(&conn),
            Arc::clone(&registry),
            config(100, 1, 3),
            CancellationToken::new(),
        ));
        let _ = registry.unregister(conn.id()).unwrap();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Terminated);
    }

    #[test]
    fn config_from_options() {
        let cfg = HeartbeatConfig::from_options(&EngineOptions::default());
        assert_eq!(cfg.interval, Duration::from_secs(15));
        assert_eq!(cfg.degraded_after, 1);
        assert_eq!(cfg.max_missed, 3);
    }
}
