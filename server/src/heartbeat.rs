//! Ping/pong liveness detection for registered connections.
//!
//! Each admitted connection gets its own heartbeat loop. Once per interval the
//! loop checks whether a pong arrived since the last ping:
//!
//! ```text
//! Idle ─tick─▶ PingSent(alive=false) ─pong─▶ Idle(alive=true)
//!                     │
//!                     ├─tick, still false─▶ Timeout  (terminate + evict)
//!                     └─ping enqueue fails─▶ SendError (evict now)
//! ```
//!
//! The loop holds only a weak reference to its connection and exits as soon
//! as the connection is evicted by anyone (takeover, removal, shutdown), not
//! on its next tick.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_HEARTBEAT_INTERVAL;
use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::types::DisconnectReason;

/// Spawns and configures per-connection liveness loops.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    interval: Duration,
}

impl HeartbeatMonitor {
    /// Creates a monitor probing every `interval`.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn new(interval: Duration) -> Self {
        assert!(!interval.is_zero(), "heartbeat interval must be non-zero");
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the heartbeat loop for `connection`.
    ///
    /// The first ping is sent one interval after attachment. The returned
    /// handle completes once the connection is evicted; dropping it does not
    /// stop the loop.
    pub fn attach(
        &self,
        registry: Arc<ConnectionRegistry>,
        connection: &Arc<Connection>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(connection);
        let interval = self.interval;
        trace!(
            connection_id = %connection.id(),
            interval_ms = interval.as_millis() as u64,
            "Heartbeat attached"
        );
        let evicted = connection.liveness_token();
        tokio::spawn(run_heartbeat_loop(registry, weak, evicted, interval))
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}

async fn run_heartbeat_loop(
    registry: Arc<ConnectionRegistry>,
    connection: Weak<Connection>,
    evicted: CancellationToken,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = evicted.cancelled() => {
                trace!("Heartbeat stopped after eviction");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(conn) = connection.upgrade() else {
            return;
        };

        if !conn.take_alive() {
            warn!(
                user_id = conn.user_id(),
                device_id = %conn.device_id(),
                connection_id = %conn.id(),
                reason = %DisconnectReason::HeartbeatTimeout,
                "No pong since last ping, terminating connection"
            );
            conn.terminate();
            registry.remove(&conn);
            return;
        }

        if let Err(err) = conn.ping() {
            debug!(
                user_id = conn.user_id(),
                device_id = %conn.device_id(),
                connection_id = %conn.id(),
                reason = %DisconnectReason::DeliveryFailure,
                error = %err,
                "Liveness ping could not be sent, evicting connection"
            );
            conn.terminate();
            registry.remove(&conn);
            return;
        }

        trace!(connection_id = %conn.id(), "Liveness ping sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use crate::types::{ConnectionState, Identity};
    use tokio::sync::mpsc;

    const PERIOD: Duration = Duration::from_secs(30);

    fn registered(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) = Connection::channel(Identity::new(1, Some("a")), capacity);
        assert!(registry.register(conn.clone()).is_admitted());
        (conn, rx)
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_clears_flag_and_sends_ping() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = registered(&registry, 8);
        let _handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        settle().await;

        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Ping);
        assert!(!conn.is_alive());
        assert!(conn.is_open());
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_keeps_connection_registered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = registered(&registry, 8);
        let _handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);

        for _ in 0..5 {
            tokio::time::sleep(PERIOD).await;
            settle().await;
            assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Ping);
            conn.mark_alive();
        }

        assert!(conn.is_open());
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_for_two_intervals_evicts() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = registered(&registry, 8);
        let handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);

        tokio::time::sleep(PERIOD * 2 + Duration::from_millis(1)).await;
        handle.await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(registry.stats().user_count, 0);
        assert!(registry.stats().connections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ping_evicts_immediately() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, rx) = registered(&registry, 8);
        drop(rx);
        let handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        handle.await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_stops_loop_before_next_tick() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = registered(&registry, 8);
        let handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);
        settle().await;

        // Takeover evicts the first connection.
        let (_second, _rx2) = registered(&registry, 8);
        settle().await;

        assert!(handle.is_finished());
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Close { .. })));

        // No ping ever fires for the evicted connection.
        tokio::time::sleep(PERIOD * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_stops_loop_before_next_tick() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, mut rx) = registered(&registry, 8);
        let handle = HeartbeatMonitor::new(PERIOD).attach(registry.clone(), &conn);
        settle().await;

        registry.remove(&conn);
        settle().await;

        assert!(handle.is_finished());
        assert!(conn.is_evicted());
        assert_eq!(registry.connection_count(), 0);

        tokio::time::sleep(PERIOD * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_connection_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = Connection::channel(Identity::new(1, None), 8);
        let handle = HeartbeatMonitor::new(PERIOD).attach(registry, &conn);
        drop(conn);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        handle.await.unwrap();
    }
}
