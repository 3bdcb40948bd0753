//! The per-run decision loop.
//!
//! Alternates language-model turns with tool executions: the model sees
//! the objective and annotated page states, answers with either a tool
//! call (one action) or plain text (the final answer), and the loop
//! executes, records, and narrates each action until completion, an
//! unrecoverable failure, or the step limit runs out.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::captcha;
use crate::errors::{BrowserError, CaptchaError, ToolError};
use crate::events::{EventSink, ServerEvent};
use crate::llm::{LanguageModel, Role, Turn};
use crate::metrics;
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{Command, Step};

const SYSTEM_PROMPT: &str = "You are a browser automation agent. You control a real \
browser through the provided tools and you see the page as annotated screenshots: \
clickable elements carry red outlines, and elements without visible text carry \
numbered yellow badges you can click by number.\n\
Rules:\n\
- Take exactly one action per turn by calling one tool.\n\
- Fill the 'action' field with a short label and 'explanation' with one sentence \
on why the action advances the objective.\n\
- If a captcha blocks the page, call handle_captcha.\n\
- When the objective is fulfilled, reply with plain text containing the final \
answer and call no tool.";

/// Tuning knobs for a loop instance.
#[derive(Clone, Copy, Debug)]
pub struct AgentSettings {
    pub max_steps: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_steps: 25 }
    }
}

/// How a loop ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LoopStatus {
    Completed,
    Failed,
    /// The session was cancelled; the run stays non-terminal.
    Cancelled,
}

/// Everything the supervisor needs to persist and report a finished run.
#[derive(Clone, Debug)]
pub struct LoopReport {
    pub status: LoopStatus,
    pub final_answer: Option<String>,
    pub failure: Option<String>,
    pub steps: Vec<Step>,
    /// All recorded commands, captcha solves included; filter with
    /// [`crate::types::traceable`] before persisting.
    pub commands: Vec<Command>,
}

pub struct DecisionLoop {
    run_id: String,
    objective: String,
    browser: Arc<Mutex<Browser>>,
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    settings: AgentSettings,
}

impl DecisionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        objective: impl Into<String>,
        browser: Arc<Mutex<Browser>>,
        model: Arc<dyn LanguageModel>,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
        settings: AgentSettings,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            objective: objective.into(),
            browser,
            model,
            registry,
            sink,
            cancel,
            settings,
        }
    }

    pub async fn run(&self) -> LoopReport {
        info!(run_id = %self.run_id, objective = %self.objective, "decision loop starting");

        let declarations = self.registry.declarations();
        let tool_ctx = ToolContext {
            browser: self.browser.clone(),
            vision: self.model.clone(),
        };

        let mut conversation = vec![
            Turn::text(Role::System, SYSTEM_PROMPT),
            Turn::text(Role::User, format!("Objective: {}", self.objective)),
        ];
        let mut steps: Vec<Step> = Vec::new();
        let mut commands: Vec<Command> = Vec::new();
        let mut previous_reply: Option<String> = None;

        for iteration in 1..=self.settings.max_steps {
            if self.cancel.is_cancelled() {
                return self.cancelled(steps, commands);
            }

            let reply = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(steps, commands),
                reply = self.model.generate(&conversation, Some(&declarations)) => reply,
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(run_id = %self.run_id, %err, "model turn failed");
                    return self.failed(steps, commands, format!("model turn failed: {err}"));
                }
            };

            // Anti-repetition guard: identical bracket-stripped text to
            // the previous turn gets a guidance nudge instead of a step.
            let stripped = strip_bracketed(&reply.text);
            if !stripped.is_empty() && previous_reply.as_deref() == Some(stripped.as_str()) {
                debug!(run_id = %self.run_id, iteration, "repeated model reply, injecting guidance");
                conversation.push(Turn::text(Role::Model, reply.text.clone()));
                conversation.push(Turn::text(
                    Role::User,
                    "You repeated your previous response. Try a different approach.",
                ));
                continue;
            }
            previous_reply = Some(stripped);

            let Some(call) = reply.call else {
                let answer = reply.text.trim().to_string();
                info!(run_id = %self.run_id, iteration, "model signalled completion");
                return LoopReport {
                    status: LoopStatus::Completed,
                    final_answer: Some(answer),
                    failure: None,
                    steps,
                    commands,
                };
            };

            let action = call.args["action"]
                .as_str()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(&call.name)
                .to_string();
            let explanation = call.args["explanation"]
                .as_str()
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| reply.text.trim().to_string());

            let step = Step {
                number: steps.len() as u32 + 1,
                action,
                explanation,
            };
            steps.push(step.clone());
            self.sink.emit(ServerEvent::StepUpdate { step: step.clone() });

            let step_started = Instant::now();

            // Captcha pre-check before the actual action touches the page.
            match self.precheck_captcha().await {
                Ok(solved) => {
                    if solved {
                        commands.push(Command::SolveCaptcha);
                    }
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, step = step.number, %err, "captcha pre-check failed");
                    conversation.push(Turn::text(Role::Model, reply.text.clone()));
                    conversation.push(Turn::text(
                        Role::User,
                        format!(
                            "A captcha blocked step {} and could not be solved: {err}. \
                             Try a different approach.",
                            step.number
                        ),
                    ));
                    continue;
                }
            }

            let dispatch = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(steps, commands),
                outcome = self.registry.dispatch(&call.name, &call.args, &tool_ctx) => outcome,
            };
            metrics::record_step(step_started.elapsed().as_millis() as f64);

            let note = match dispatch {
                Ok(outcome) => {
                    commands.push(outcome.command);
                    outcome.detail
                }
                Err(ToolError::Browser(BrowserError::Closed)) => {
                    return self.failed(steps, commands, "browser closed".to_string());
                }
                Err(err) => {
                    warn!(run_id = %self.run_id, step = step.number, %err, "step failed");
                    format!("The action failed: {err}. Choose a different action.")
                }
            };

            // Feed the model the post-action page state.
            conversation.push(Turn::text(Role::Model, reply.text.clone()));
            let mut observation = Turn::text(
                Role::User,
                format!("Step {} result: {note}. The current page state follows.", step.number),
            );
            match self.capture_state().await {
                Ok(Some(shot)) => {
                    observation = observation.with_image("image/jpeg", shot);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(run_id = %self.run_id, %err, "post-action screenshot failed");
                }
            }
            conversation.push(observation);

            debug!(run_id = %self.run_id, iteration, step = step.number, "iteration finished");
        }

        self.failed(steps, commands, "max steps".to_string())
    }

    /// Returns whether a captcha was present and solved.
    async fn precheck_captcha(&self) -> Result<bool, CaptchaError> {
        let browser = self.browser.lock().await;
        let report = captcha::precheck(&browser, self.model.as_ref(), self.sink.as_ref()).await?;
        Ok(matches!(report, captcha::SolveReport::Solved { .. }))
    }

    async fn capture_state(&self) -> Result<Option<String>, BrowserError> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let browser = self.browser.lock().await;
        browser.capture_page_state().await.map(Some)
    }

    fn cancelled(&self, steps: Vec<Step>, commands: Vec<Command>) -> LoopReport {
        info!(run_id = %self.run_id, "decision loop cancelled");
        LoopReport {
            status: LoopStatus::Cancelled,
            final_answer: None,
            failure: Some("session cancelled".into()),
            steps,
            commands,
        }
    }

    fn failed(&self, steps: Vec<Step>, commands: Vec<Command>, reason: String) -> LoopReport {
        warn!(run_id = %self.run_id, reason = %reason, "decision loop failed");
        LoopReport {
            status: LoopStatus::Failed,
            final_answer: None,
            failure: Some(reason),
            steps,
            commands,
        }
    }
}

/// Remove bracketed decorators (`[...]`) and collapse the remainder for
/// the repetition comparison.
fn strip_bracketed(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut depth = 0usize;
    for ch in text.chars() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
