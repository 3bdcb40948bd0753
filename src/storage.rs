//! Store capability for runs and automations.
//!
//! The real deployment fronts a relational store owned by the CRUD
//! service; the engine only needs the narrow contract below. Every read
//! and write is scoped by user id. Terminal runs are immutable: a
//! second terminal write is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::StoreError;
use crate::types::{Automation, Command, Run, RunStatus, Step};

/// Persisted shape of a run's step log, mirroring the storage column
/// `{steps:[...], finalAnswer:""}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepLog {
    pub steps: Vec<Step>,
    #[serde(rename = "finalAnswer")]
    pub final_answer: String,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn fetch_run(&self, user_id: &str, run_id: &str) -> Result<Run, StoreError>;

    async fn mark_in_progress(&self, user_id: &str, run_id: &str) -> Result<(), StoreError>;

    /// Persist the terminal outcome of a run: status, step log, final
    /// answer, and the replayable trace.
    async fn finish_run(
        &self,
        user_id: &str,
        run_id: &str,
        status: RunStatus,
        steps: Vec<Step>,
        final_answer: Option<String>,
        trace: Vec<Command>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    async fn fetch_automation(
        &self,
        user_id: &str,
        automation_id: &str,
    ) -> Result<Automation, StoreError>;
}

/// In-memory backend used by tests and the development serve mode.
#[derive(Default)]
pub struct MemoryStore {
    runs: DashMap<String, Run>,
    automations: DashMap<String, Automation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_run(&self, run: Run) {
        self.runs.insert(run.id.clone(), run);
    }

    pub fn insert_automation(&self, automation: Automation) {
        self.automations
            .insert(automation.id.clone(), automation);
    }

    /// Serialized step-log column for a run, useful in assertions.
    pub fn step_log_json(&self, run_id: &str) -> Option<serde_json::Value> {
        self.runs.get(run_id).map(|run| {
            json!(StepLog {
                steps: run.steps.clone(),
                final_answer: run.final_answer.clone().unwrap_or_default(),
            })
        })
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn fetch_run(&self, user_id: &str, run_id: &str) -> Result<Run, StoreError> {
        let run = self
            .runs
            .get(run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if run.user_id != user_id {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(run)
    }

    async fn mark_in_progress(&self, user_id: &str, run_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if entry.user_id != user_id {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        if entry.status.is_terminal() {
            return Err(StoreError::Terminal(run_id.to_string()));
        }
        entry.status = RunStatus::InProgress;
        if entry.started_at.is_none() {
            entry.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        user_id: &str,
        run_id: &str,
        status: RunStatus,
        steps: Vec<Step>,
        final_answer: Option<String>,
        trace: Vec<Command>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Backend(format!(
                "finish_run called with non-terminal status {status:?}"
            )));
        }
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if entry.user_id != user_id {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        if entry.status.is_terminal() {
            return Err(StoreError::Terminal(run_id.to_string()));
        }
        entry.status = status;
        entry.steps = steps;
        entry.final_answer = final_answer;
        entry.trace = trace;
        entry.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl AutomationStore for MemoryStore {
    async fn fetch_automation(
        &self,
        user_id: &str,
        automation_id: &str,
    ) -> Result<Automation, StoreError> {
        let automation = self
            .automations
            .get(automation_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("automation {automation_id}")))?;
        if automation.user_id != user_id {
            return Err(StoreError::NotFound(format!("automation {automation_id}")));
        }
        Ok(automation)
    }
}

/// Store adapter bound to one authenticated user. Sessions hold one of
/// these after authentication so no later call can cross user scopes.
#[derive(Clone)]
pub struct UserStore {
    user_id: String,
    runs: Arc<dyn RunStore>,
    automations: Arc<dyn AutomationStore>,
}

impl UserStore {
    pub fn new(
        user_id: impl Into<String>,
        runs: Arc<dyn RunStore>,
        automations: Arc<dyn AutomationStore>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            runs,
            automations,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn fetch_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.runs.fetch_run(&self.user_id, run_id).await
    }

    pub async fn mark_in_progress(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs.mark_in_progress(&self.user_id, run_id).await
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        steps: Vec<Step>,
        final_answer: Option<String>,
        trace: Vec<Command>,
    ) -> Result<(), StoreError> {
        self.runs
            .finish_run(&self.user_id, run_id, status, steps, final_answer, trace)
            .await
    }

    pub async fn fetch_automation(&self, automation_id: &str) -> Result<Automation, StoreError> {
        self.automations
            .fetch_automation(&self.user_id, automation_id)
            .await
    }
}
