//! Wire frames exchanged with clients and the event sink capability.
//!
//! Frames are JSON text messages tagged by `type`. The server never
//! reorders events within a session; screenshot frames are lossy by
//! design and travel on a separate bounded path.

use serde::{Deserialize, Serialize};

use crate::types::{Command, Step};

/// Messages a client may send on either websocket endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    StartAgent {
        #[serde(rename = "runId")]
        run_id: String,
    },
    StartScript {
        #[serde(rename = "automationId")]
        automation_id: String,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    Success,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Frames the server emits to a client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authentication {
        status: AuthOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Live mode: a new step was appended to the run.
    StepUpdate { step: Step },
    /// Replay mode: command `number` is about to execute.
    StepStarted { number: u32 },
    /// Replay mode: command `number` finished.
    StepCompleted { number: u32 },
    ScreenshotUpdate {
        screenshot: String,
        #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(rename = "automationId", skip_serializing_if = "Option::is_none")]
        automation_id: Option<String>,
    },
    CaptchaDetected,
    CaptchaSolved,
    Completion {
        status: CompletionStatus,
        #[serde(rename = "finalAnswer", skip_serializing_if = "Option::is_none")]
        final_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        steps: Option<Vec<Step>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        commands: Option<Vec<Command>>,
    },
    Error { error: String },
}

impl ServerEvent {
    /// Screenshot frames may be dropped under backpressure; everything
    /// else must be delivered.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ServerEvent::ScreenshotUpdate { .. })
    }
}

/// Sink through which the decision loop and replay engine publish
/// events. The supervisor owns the concrete implementation; the loops
/// receive it by construction and never talk to sockets directly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServerEvent);
}

/// Sink that discards everything; used by headless invocations and tests.
#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ServerEvent) {}
}

/// Sink that records events in memory for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<ServerEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ServerEvent) {
        self.events.lock().push(event);
    }
}
