//! Core domain types shared across the agent, replay, and server layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a run. `Failed` and `Completed` are terminal; a run
/// reaches a terminal status exactly once.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "INPROGRESS")]
    InProgress,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Completed)
    }
}

/// One observable decision cycle, numbered densely from 1 within a run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub action: String,
    pub explanation: String,
}

/// A single replayable browser action recorded during a live run.
///
/// `SolveCaptcha` is produced while a run executes but is filtered out
/// of the trace persisted for replay; captcha handling is implicit when
/// a trace is replayed.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Navigate { url: String },
    Search { query: String },
    Click { identifier: String },
    Type { placeholder: String, text: String },
    TypeAndEnter { placeholder: String, text: String },
    Scroll,
    Back,
    SolveCaptcha,
}

impl Command {
    /// Whether this command belongs in a persisted trace.
    pub fn is_traceable(&self) -> bool {
        !matches!(self, Command::SolveCaptcha)
    }

    /// Short label used in step summaries and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::Navigate { .. } => "navigate",
            Command::Search { .. } => "search",
            Command::Click { .. } => "click",
            Command::Type { .. } => "type",
            Command::TypeAndEnter { .. } => "type_and_enter",
            Command::Scroll => "scroll",
            Command::Back => "back",
            Command::SolveCaptcha => "solve_captcha",
        }
    }
}

/// Filter a recorded command stream down to the replayable trace.
pub fn traceable(commands: &[Command]) -> Vec<Command> {
    commands
        .iter()
        .filter(|cmd| cmd.is_traceable())
        .cloned()
        .collect()
}

/// One end-to-end execution of a user objective.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub user_id: String,
    pub objective: String,
    pub status: RunStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub trace: Vec<Command>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        objective: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            objective: objective.into(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
            final_answer: None,
            trace: Vec::new(),
        }
    }
}

/// A saved trace, independent of any run, replayable any number of times.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub objective: String,
    pub trace: Vec<Command>,
}
