//! Per-client websocket connection state.
//!
//! Each connection owns two outbound paths: an unbounded reliable
//! channel for control events and a small bounded channel for lossy
//! screenshot frames. When the client reads slowly, frames are dropped
//! and counted, never control events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::events::{EventSink, ServerEvent};
use crate::storage::UserStore;

/// Frame headed for the socket writer task.
#[derive(Clone, Debug)]
pub enum Outbound {
    Text(Arc<String>),
    Ping,
}

pub struct ClientConnection {
    pub id: String,
    /// Set after successful authentication.
    user_store: Mutex<Option<UserStore>>,
    control_tx: mpsc::UnboundedSender<Outbound>,
    frame_tx: mpsc::Sender<Outbound>,
    pub connected_at: Instant,
    is_alive: AtomicBool,
    agent_started: AtomicBool,
    dropped_frames: AtomicU64,
}

impl ClientConnection {
    pub fn new(
        id: String,
        control_tx: mpsc::UnboundedSender<Outbound>,
        frame_tx: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            user_store: Mutex::new(None),
            control_tx,
            frame_tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            agent_started: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn authenticate(&self, store: UserStore) {
        *self.user_store.lock() = Some(store);
    }

    pub fn user_store(&self) -> Option<UserStore> {
        self.user_store.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_store.lock().is_some()
    }

    /// Claim the session's single agent slot. Returns false when an
    /// agent already ran on this session.
    pub fn claim_agent_slot(&self) -> bool {
        !self.agent_started.swap(true, Ordering::SeqCst)
    }

    /// Queue a reliable control frame.
    pub fn send_text(&self, payload: Arc<String>) -> bool {
        self.control_tx.send(Outbound::Text(payload)).is_ok()
    }

    /// Queue a lossy screenshot frame; drops (and counts) when the
    /// channel is full.
    pub fn send_frame(&self, payload: Arc<String>) -> bool {
        if self.frame_tx.try_send(Outbound::Text(payload)).is_ok() {
            true
        } else {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn request_ping(&self) -> bool {
        self.control_tx.send(Outbound::Ping).is_ok()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Mark the connection alive (pong or any client activity).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag; returns whether the peer showed
    /// life since the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }
}

impl EventSink for ClientConnection {
    fn emit(&self, event: ServerEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => Arc::new(payload),
            Err(err) => {
                debug!(connection = %self.id, %err, "failed to serialize event");
                return;
            }
        };
        if event.is_lossy() {
            self.send_frame(payload);
        } else {
            self.send_text(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CompletionStatus;

    fn make_connection() -> (
        Arc<ClientConnection>,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::Receiver<Outbound>,
    ) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(2);
        (
            Arc::new(ClientConnection::new("conn-1".into(), control_tx, frame_tx)),
            control_rx,
            frame_rx,
        )
    }

    #[tokio::test]
    async fn control_events_use_the_reliable_path() {
        let (conn, mut control_rx, _frame_rx) = make_connection();
        conn.emit(ServerEvent::Completion {
            status: CompletionStatus::Completed,
            final_answer: Some("42".into()),
            message: None,
            steps: None,
            commands: None,
        });
        let Outbound::Text(payload) = control_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert!(payload.contains("completion"));
    }

    #[tokio::test]
    async fn screenshots_drop_when_the_frame_channel_is_full() {
        let (conn, _control_rx, _frame_rx) = make_connection();
        let shot = |index: u32| ServerEvent::ScreenshotUpdate {
            screenshot: format!("frame-{index}"),
            run_id: Some("run-1".into()),
            automation_id: None,
        };
        conn.emit(shot(1));
        conn.emit(shot(2));
        conn.emit(shot(3)); // channel capacity 2: dropped
        assert_eq!(conn.dropped_frames(), 1);
    }

    #[test]
    fn agent_slot_is_single_use() {
        let (conn, _control_rx, _frame_rx) = make_connection();
        assert!(conn.claim_agent_slot());
        assert!(!conn.claim_agent_slot());
        assert!(!conn.claim_agent_slot());
    }

    #[test]
    fn alive_flag_resets_on_check() {
        let (conn, _control_rx, _frame_rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn unauthenticated_by_default() {
        let (conn, _control_rx, _frame_rx) = make_connection();
        assert!(!conn.is_authenticated());
        assert!(conn.user_store().is_none());
    }
}
