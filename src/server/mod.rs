//! HTTP/websocket surface.
//!
//! Two upgrade endpoints carry the control channel: `/agent` for live
//! runs and `/automation` for replays. Everything else on the router is
//! ambient: health probes, prometheus metrics, CORS.

pub mod connection;
pub mod heartbeat;
pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{ClientMessage, EventSink, ServerEvent};
use crate::metrics;

use connection::{ClientConnection, Outbound};
use heartbeat::{run_heartbeat, HeartbeatResult};
use supervisor::Supervisor;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionMode {
    Live,
    Replay,
}

#[derive(Clone)]
pub struct ServeState {
    pub supervisor: Arc<Supervisor>,
    pub health: Arc<ServeHealth>,
}

#[derive(Default)]
pub struct ServeHealth {
    live: AtomicBool,
    ready: AtomicBool,
}

impl ServeHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_live(&self) {
        self.live.store(true, Ordering::SeqCst);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

pub fn build_router(state: ServeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/agent", get(agent_handler))
        .route("/automation", get(automation_handler))
        .route("/health", get(health_handler))
        .route("/livez", get(live_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

async fn agent_handler(
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, SessionMode::Live, state))
}

async fn automation_handler(
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, SessionMode::Replay, state))
}

async fn health_handler(State(state): State<ServeState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "live": state.health.is_live(),
        "ready": state.health.is_ready(),
        "active_sessions": state.supervisor.active_sessions(),
    }))
}

async fn live_handler(State(state): State<ServeState>) -> impl IntoResponse {
    let status = if state.health.is_live() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "live": state.health.is_live() })))
}

async fn ready_handler(State(state): State<ServeState>) -> impl IntoResponse {
    let status = if state.health.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": state.health.is_ready() })))
}

async fn metrics_handler() -> impl IntoResponse {
    metrics::register_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metrics::global_registry().gather(), &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metric encode error".to_string(),
        )
            .into_response();
    }
    match String::from_utf8(buffer) {
        Ok(body) => body.into_response(),
        Err(err) => {
            error!(?err, "metrics were not valid utf8");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "metric encode error".to_string(),
            )
                .into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, mode: SessionMode, state: ServeState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let (frame_tx, mut frame_rx) = mpsc::channel(8);

    let session_id = Uuid::new_v4().to_string();
    let conn = Arc::new(ClientConnection::new(
        session_id.clone(),
        control_tx,
        frame_tx,
    ));
    let cancel = CancellationToken::new();
    state
        .supervisor
        .register_session(&session_id, cancel.clone());
    info!(session = %session_id, ?mode, "client connected");

    // Writer task: control frames win over screenshot frames.
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = control_rx.recv() => frame,
                frame = frame_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };
            let message = match frame {
                Outbound::Text(payload) => Message::Text(payload.as_ref().clone()),
                Outbound::Ping => Message::Ping(Vec::new()),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Heartbeat sweep: a peer that misses a full interval is reaped.
    let heartbeat_cancel = cancel.clone();
    let heartbeat_conn = conn.clone();
    let heartbeat_interval =
        Duration::from_secs(state.supervisor.config().server.heartbeat_interval_secs);
    let heartbeat = tokio::spawn(async move {
        if run_heartbeat(heartbeat_conn, heartbeat_interval, heartbeat_cancel.clone()).await
            == HeartbeatResult::TimedOut
        {
            heartbeat_cancel.cancel();
        }
    });

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = ws_rx.next() => message,
        };
        let Some(message) = message else { break };
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %session_id, %err, "websocket receive error");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                conn.mark_alive();
                let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                let Ok(client_message) = parsed else {
                    conn.emit(ServerEvent::Error {
                        error: "unrecognized message".into(),
                    });
                    continue;
                };
                if !handle_client_message(client_message, mode, &state, &conn, &cancel).await {
                    break;
                }
            }
            Message::Pong(_) => conn.mark_alive(),
            // The protocol layer answers pings; seeing one still counts
            // as client activity.
            Message::Ping(_) => conn.mark_alive(),
            Message::Close(frame) => {
                debug!(session = %session_id, ?frame, "client closed the socket");
                break;
            }
            Message::Binary(_) => {}
        }
    }

    // Cleanup: cancel the loop, reap tasks, unregister the session.
    cancel.cancel();
    heartbeat.abort();
    state.supervisor.unregister_session(&session_id);
    drop(conn);
    let _ = writer.await;
    info!(session = %session_id, "session closed");
}

/// Returns false when the connection should close.
async fn handle_client_message(
    message: ClientMessage,
    mode: SessionMode,
    state: &ServeState,
    conn: &Arc<ClientConnection>,
    cancel: &CancellationToken,
) -> bool {
    match message {
        ClientMessage::Authenticate { token } => {
            state.supervisor.authenticate(conn, &token).await
        }
        ClientMessage::Heartbeat { .. } => true,
        ClientMessage::StartAgent { run_id } => {
            if mode != SessionMode::Live {
                conn.emit(ServerEvent::Error {
                    error: "start_agent is only valid on the live endpoint".into(),
                });
                return true;
            }
            start_session_task(state, conn, cancel, move |supervisor, conn, cancel| {
                Box::pin(supervisor.run_live(conn, run_id, cancel))
            })
        }
        ClientMessage::StartScript { automation_id } => {
            if mode != SessionMode::Replay {
                conn.emit(ServerEvent::Error {
                    error: "start_script is only valid on the replay endpoint".into(),
                });
                return true;
            }
            start_session_task(state, conn, cancel, move |supervisor, conn, cancel| {
                Box::pin(supervisor.run_replay(conn, automation_id, cancel))
            })
        }
    }
}

fn start_session_task(
    state: &ServeState,
    conn: &Arc<ClientConnection>,
    cancel: &CancellationToken,
    task: impl FnOnce(
            Arc<Supervisor>,
            Arc<ClientConnection>,
            CancellationToken,
        ) -> futures::future::BoxFuture<'static, bool>
        + Send
        + 'static,
) -> bool {
    if !conn.is_authenticated() {
        conn.emit(ServerEvent::Error {
            error: "authenticate first".into(),
        });
        return false;
    }
    if !conn.claim_agent_slot() {
        conn.emit(ServerEvent::Error {
            error: "an agent is already active on this session".into(),
        });
        return true;
    }

    let supervisor = state.supervisor.clone();
    let conn = conn.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let close_after = task(supervisor, conn, cancel.clone()).await;
        if close_after {
            cancel.cancel();
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::config::AppConfig;
    use crate::errors::BrowserError;
    use crate::llm::ScriptedModel;
    use crate::storage::MemoryStore;

    fn serve_state() -> ServeState {
        let store = Arc::new(MemoryStore::new());
        let factory: supervisor::BrowserFactory = Arc::new(|| {
            Box::pin(async { Err(BrowserError::Closed) })
        });
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(StaticTokenVerifier::new("token", "user-a")),
            store.clone(),
            store,
            Arc::new(ScriptedModel::new(vec![])),
            AppConfig::default(),
            factory,
        ));
        ServeState {
            supervisor,
            health: Arc::new(ServeHealth::new()),
        }
    }

    #[test]
    fn health_state_flips() {
        let health = ServeHealth::new();
        assert!(!health.is_live());
        assert!(!health.is_ready());
        health.mark_live();
        health.mark_ready();
        assert!(health.is_live());
        assert!(health.is_ready());
    }

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        // Smoke check that the router accepts the state type.
        let _router = build_router(serve_state());
    }

    #[tokio::test]
    async fn unauthenticated_start_closes_the_session() {
        let state = serve_state();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(2);
        let conn = Arc::new(ClientConnection::new("c1".into(), control_tx, frame_tx));
        let cancel = CancellationToken::new();

        let keep_open = handle_client_message(
            ClientMessage::StartAgent {
                run_id: "run-1".into(),
            },
            SessionMode::Live,
            &state,
            &conn,
            &cancel,
        )
        .await;
        assert!(!keep_open);
        let Some(Outbound::Text(payload)) = control_rx.recv().await else {
            panic!("expected error frame");
        };
        assert!(payload.contains("authenticate first"));
    }

    #[tokio::test]
    async fn start_on_wrong_endpoint_is_rejected() {
        let state = serve_state();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(2);
        let conn = Arc::new(ClientConnection::new("c2".into(), control_tx, frame_tx));
        let cancel = CancellationToken::new();

        let keep_open = handle_client_message(
            ClientMessage::StartScript {
                automation_id: "auto-1".into(),
            },
            SessionMode::Live,
            &state,
            &conn,
            &cancel,
        )
        .await;
        assert!(keep_open);
        let Some(Outbound::Text(payload)) = control_rx.recv().await else {
            panic!("expected error frame");
        };
        assert!(payload.contains("replay endpoint"));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let state = serve_state();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(2);
        let conn = Arc::new(ClientConnection::new("c3".into(), control_tx, frame_tx));
        state.supervisor.authenticate(&conn, "token").await;
        let _ = control_rx.recv().await; // authentication frame
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            handle_client_message(
                ClientMessage::StartAgent {
                    run_id: "run-x".into(),
                },
                SessionMode::Live,
                &state,
                &conn,
                &cancel,
            )
            .await;
        }

        // Drain until we find the rejection.
        let mut rejected = false;
        while let Ok(Outbound::Text(payload)) = control_rx.try_recv() {
            if payload.contains("already active") {
                rejected = true;
            }
        }
        assert!(rejected);
    }
}
