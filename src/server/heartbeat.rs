//! Ping/pong liveness monitoring for client connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::ClientConnection;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatResult {
    /// The peer showed no life between two consecutive ticks.
    TimedOut,
    Cancelled,
}

/// Ping the peer every `interval` and check for life at each tick. A
/// peer that has not ponged (or sent anything) since the prior tick is
/// considered dead.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the peer gets a full
    // interval before the first liveness check.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !connection.check_alive() {
                    debug!(connection = %connection.id, "heartbeat timed out");
                    return HeartbeatResult::TimedOut;
                }
                if !connection.request_ping() {
                    return HeartbeatResult::Cancelled;
                }
            }
            _ = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::connection::Outbound;
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::UnboundedReceiver<Outbound>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(2);
        (
            Arc::new(ClientConnection::new("hb-conn".into(), control_tx, frame_tx)),
            control_rx,
        )
    }

    #[tokio::test]
    async fn cancelled_heartbeat_returns_promptly() {
        let (conn, _rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            conn,
            Duration::from_secs(60),
            cancel.clone(),
        ));
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (conn, _rx) = make_connection();
        // Consume the initial alive flag so the first check misses.
        conn.check_alive();
        let result = run_heartbeat(
            conn,
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[tokio::test]
    async fn responsive_peer_stays_connected() {
        let (conn, mut rx) = make_connection();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat(
            conn.clone(),
            Duration::from_millis(30),
            cancel.clone(),
        ));

        // Answer pings for a few ticks.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.mark_alive();
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);

        // At least one ping was requested along the way.
        let mut pinged = false;
        while let Ok(frame) = rx.try_recv() {
            if matches!(frame, Outbound::Ping) {
                pinged = true;
            }
        }
        assert!(pinged);
    }
}
