//! Session supervision: authentication, agent dispatch, screenshot
//! pumping, and durable run-status transitions.
//!
//! One supervisor owns every live session in the process. A session
//! pairs one client connection with at most one decision loop or
//! replay; terminal transitions are persisted before the completion
//! frame is emitted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentSettings, DecisionLoop, LoopStatus};
use crate::auth::TokenVerifier;
use crate::browser::Browser;
use crate::config::AppConfig;
use crate::errors::BrowserError;
use crate::events::{AuthOutcome, CompletionStatus, EventSink, ServerEvent};
use crate::llm::LanguageModel;
use crate::metrics;
use crate::replay::{ReplayOutcome, Replayer};
use crate::storage::{AutomationStore, RunStore, UserStore};
use crate::tools::ToolRegistry;
use crate::types::{traceable, RunStatus};

use super::connection::ClientConnection;

/// Allocates a fresh browser per dispatched session.
pub type BrowserFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Browser, BrowserError>> + Send + Sync>;

pub struct Supervisor {
    verifier: Arc<dyn TokenVerifier>,
    runs: Arc<dyn RunStore>,
    automations: Arc<dyn AutomationStore>,
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    config: AppConfig,
    browser_factory: BrowserFactory,
    active: DashMap<String, CancellationToken>,
}

impl Supervisor {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        runs: Arc<dyn RunStore>,
        automations: Arc<dyn AutomationStore>,
        model: Arc<dyn LanguageModel>,
        config: AppConfig,
        browser_factory: BrowserFactory,
    ) -> Self {
        Self {
            verifier,
            runs,
            automations,
            model,
            registry: Arc::new(ToolRegistry::standard()),
            config,
            browser_factory,
            active: DashMap::new(),
        }
    }

    /// Factory launching real Chromium instances from configuration.
    pub fn chromium_factory(config: &AppConfig) -> BrowserFactory {
        let launch_cfg = config.browser.clone();
        Arc::new(move || {
            let launch_cfg = launch_cfg.clone();
            Box::pin(async move { Browser::launch(launch_cfg).await })
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn register_session(&self, session_id: &str, cancel: CancellationToken) {
        self.active.insert(session_id.to_string(), cancel);
    }

    pub fn unregister_session(&self, session_id: &str) {
        self.active.remove(session_id);
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }

    /// Cancel every live session; used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    /// Verify the token of an `authenticate` frame. On success the
    /// connection gains a user-scoped store adapter.
    pub async fn authenticate(&self, connection: &ClientConnection, token: &str) -> bool {
        match self.verifier.verify(token).await {
            Ok(claims) => {
                connection.authenticate(UserStore::new(
                    claims.user_id.clone(),
                    self.runs.clone(),
                    self.automations.clone(),
                ));
                info!(connection = %connection.id, user_id = %claims.user_id, "session authenticated");
                connection.emit(ServerEvent::Authentication {
                    status: AuthOutcome::Success,
                    error: None,
                });
                true
            }
            Err(err) => {
                warn!(connection = %connection.id, %err, "authentication failed");
                connection.emit(ServerEvent::Authentication {
                    status: AuthOutcome::Failed,
                    error: Some(err.to_string()),
                });
                false
            }
        }
    }

    /// Drive a live run on this session. Returns true when the caller
    /// should close the connection afterwards.
    pub async fn run_live(
        self: Arc<Self>,
        connection: Arc<ClientConnection>,
        run_id: String,
        cancel: CancellationToken,
    ) -> bool {
        let Some(store) = connection.user_store() else {
            connection.emit(ServerEvent::Error {
                error: "not authenticated".into(),
            });
            return true;
        };

        let run = match store.fetch_run(&run_id).await {
            Ok(run) => run,
            Err(err) => {
                connection.emit(ServerEvent::Error {
                    error: err.to_string(),
                });
                return false;
            }
        };

        // A terminal run is served from its persisted record.
        if run.status.is_terminal() {
            debug!(run_id = %run.id, status = ?run.status, "replaying persisted run record");
            for step in &run.steps {
                connection.emit(ServerEvent::StepUpdate { step: step.clone() });
            }
            connection.emit(ServerEvent::Completion {
                status: completion_status(run.status),
                final_answer: run.final_answer.clone(),
                message: None,
                steps: Some(run.steps.clone()),
                commands: Some(run.trace.clone()),
            });
            return true;
        }

        if let Err(err) = store.mark_in_progress(&run_id).await {
            connection.emit(ServerEvent::Error {
                error: err.to_string(),
            });
            return false;
        }
        metrics::record_run("started");

        let browser = match (self.browser_factory)().await {
            Ok(browser) => Arc::new(Mutex::new(browser)),
            Err(err) => {
                error!(run_id = %run.id, %err, "browser allocation failed");
                self.persist_and_complete(
                    &connection,
                    &store,
                    &run_id,
                    RunStatus::Failed,
                    Vec::new(),
                    None,
                    Vec::new(),
                    Some(format!("browser allocation failed: {err}")),
                )
                .await;
                return false;
            }
        };

        let pump = spawn_screenshot_pump(
            connection.clone(),
            browser.clone(),
            cancel.clone(),
            Duration::from_millis(self.config.limits.live_screenshot_ms),
            Some(run_id.clone()),
            None,
        );

        let sink: Arc<dyn EventSink> = connection.clone();
        let agent = DecisionLoop::new(
            run.id.clone(),
            run.objective.clone(),
            browser.clone(),
            self.model.clone(),
            self.registry.clone(),
            sink,
            cancel.clone(),
            AgentSettings {
                max_steps: self.config.limits.max_steps,
            },
        );
        let report = agent.run().await;

        pump.abort();

        match report.status {
            LoopStatus::Completed => {
                metrics::record_run("completed");
                self.persist_and_complete(
                    &connection,
                    &store,
                    &run_id,
                    RunStatus::Completed,
                    report.steps,
                    report.final_answer,
                    traceable(&report.commands),
                    None,
                )
                .await;
            }
            LoopStatus::Failed => {
                metrics::record_run("failed");
                self.persist_and_complete(
                    &connection,
                    &store,
                    &run_id,
                    RunStatus::Failed,
                    report.steps,
                    None,
                    traceable(&report.commands),
                    report.failure,
                )
                .await;
            }
            LoopStatus::Cancelled => {
                // The run stays in its last persisted state for resume.
                info!(run_id = %run.id, "run cancelled; left non-terminal");
            }
        }

        close_browser(&browser).await;
        false
    }

    /// Drive a trace replay on this session.
    pub async fn run_replay(
        self: Arc<Self>,
        connection: Arc<ClientConnection>,
        automation_id: String,
        cancel: CancellationToken,
    ) -> bool {
        let Some(store) = connection.user_store() else {
            connection.emit(ServerEvent::Error {
                error: "not authenticated".into(),
            });
            return true;
        };

        let automation = match store.fetch_automation(&automation_id).await {
            Ok(automation) => automation,
            Err(err) => {
                connection.emit(ServerEvent::Error {
                    error: err.to_string(),
                });
                return false;
            }
        };

        let browser = match (self.browser_factory)().await {
            Ok(browser) => Arc::new(Mutex::new(browser)),
            Err(err) => {
                error!(automation_id = %automation.id, %err, "browser allocation failed");
                connection.emit(ServerEvent::Completion {
                    status: CompletionStatus::Failed,
                    final_answer: None,
                    message: Some(format!("browser allocation failed: {err}")),
                    steps: None,
                    commands: None,
                });
                return false;
            }
        };

        let pump = spawn_screenshot_pump(
            connection.clone(),
            browser.clone(),
            cancel.clone(),
            Duration::from_millis(self.config.limits.replay_screenshot_ms),
            None,
            Some(automation.id.clone()),
        );

        let sink: Arc<dyn EventSink> = connection.clone();
        let replayer = Replayer::new(
            automation,
            browser.clone(),
            Some(self.model.clone()),
            self.registry.clone(),
            sink,
            cancel.clone(),
            Duration::from_millis(self.config.limits.replay_step_grace_ms),
        );
        let outcome = replayer.run().await;

        pump.abort();

        match outcome {
            ReplayOutcome::Completed { message } => {
                connection.emit(ServerEvent::Completion {
                    status: CompletionStatus::Completed,
                    final_answer: None,
                    message: Some(message),
                    steps: None,
                    commands: None,
                });
            }
            ReplayOutcome::Failed { reason } => {
                connection.emit(ServerEvent::Completion {
                    status: CompletionStatus::Failed,
                    final_answer: None,
                    message: Some(reason),
                    steps: None,
                    commands: None,
                });
            }
            ReplayOutcome::Cancelled => {}
        }

        close_browser(&browser).await;
        false
    }

    /// Persist the terminal state, then (and only then) emit the
    /// completion frame. A store failure surfaces as an error frame.
    #[allow(clippy::too_many_arguments)]
    async fn persist_and_complete(
        &self,
        connection: &ClientConnection,
        store: &UserStore,
        run_id: &str,
        status: RunStatus,
        steps: Vec<crate::types::Step>,
        final_answer: Option<String>,
        trace: Vec<crate::types::Command>,
        failure: Option<String>,
    ) {
        if let Err(err) = store
            .finish_run(
                run_id,
                status,
                steps.clone(),
                final_answer.clone(),
                trace.clone(),
            )
            .await
        {
            error!(run_id, %err, "failed to persist terminal run state");
            connection.emit(ServerEvent::Error {
                error: format!("failed to persist run: {err}"),
            });
            return;
        }

        connection.emit(ServerEvent::Completion {
            status: completion_status(status),
            final_answer,
            message: failure,
            steps: Some(steps),
            commands: Some(trace),
        });
    }
}

fn completion_status(status: RunStatus) -> CompletionStatus {
    match status {
        RunStatus::Completed => CompletionStatus::Completed,
        _ => CompletionStatus::Failed,
    }
}

async fn close_browser(browser: &Arc<Mutex<Browser>>) {
    let browser = browser.lock().await;
    if let Err(err) = browser.close().await {
        warn!(%err, "browser close failed");
    }
}

/// Periodic viewport broadcast. The pump shares the session's browser
/// lock with tool dispatch and yields immediately when contended.
fn spawn_screenshot_pump(
    connection: Arc<ClientConnection>,
    browser: Arc<Mutex<Browser>>,
    cancel: CancellationToken,
    period: Duration,
    run_id: Option<String>,
    automation_id: Option<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Never contend with an in-flight tool action.
            let Ok(browser) = browser.try_lock() else {
                continue;
            };
            match browser.screenshot_raw().await {
                Ok(screenshot) => {
                    connection.emit(ServerEvent::ScreenshotUpdate {
                        screenshot,
                        run_id: run_id.clone(),
                        automation_id: automation_id.clone(),
                    });
                }
                Err(err) => {
                    debug!(%err, "screenshot pump capture failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::browser::ScriptedTransport;
    use crate::config::BrowserLaunchConfig;
    use crate::llm::{FunctionCall, ModelReply, ScriptedModel};
    use crate::server::connection::Outbound;
    use crate::storage::MemoryStore;
    use crate::types::{Automation, Command, Run};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn scripted_factory() -> BrowserFactory {
        Arc::new(|| {
            Box::pin(async {
                let transport = Arc::new(ScriptedTransport::new(Box::new(|method, params| {
                    match method {
                        "Page.captureScreenshot" => Ok(json!({ "data": "cGl4ZWxz" })),
                        "Runtime.evaluate" => {
                            let expr = params["expression"].as_str().unwrap_or_default();
                            if expr.contains("readyState") {
                                Ok(json!({ "result": { "value": "complete" } }))
                            } else if expr.contains("recaptcha/enterprise/anchor") {
                                Ok(json!({ "result": { "value": "{\"kind\":null}" } }))
                            } else if expr.contains("highlighted") || expr.contains("cleared") {
                                Ok(json!({ "result": { "value": "{\"highlighted\":0,\"labeled\":0,\"cleared\":0,\"badges\":0}" } }))
                            } else if expr.contains("isVisible") {
                                Ok(json!({ "result": { "value": "{\"found\":true,\"x\":2.0,\"y\":2.0}" } }))
                            } else {
                                Ok(json!({ "result": { "value": "" } }))
                            }
                        }
                        _ => Ok(json!({})),
                    }
                })));
                Ok(Browser::new(
                    transport,
                    BrowserLaunchConfig {
                        settle_ms: 0,
                        ..BrowserLaunchConfig::default()
                    },
                ))
            })
        })
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        store: Arc<MemoryStore>,
        connection: Arc<ClientConnection>,
        control_rx: mpsc::UnboundedReceiver<Outbound>,
    }

    fn harness(replies: Vec<ModelReply>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let mut config = AppConfig::default();
        config.limits.replay_step_grace_ms = 0;
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(StaticTokenVerifier::new("token", "user-a")),
            store.clone(),
            store.clone(),
            Arc::new(ScriptedModel::new(replies)),
            config,
            scripted_factory(),
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        let connection = Arc::new(ClientConnection::new("conn-1".into(), control_tx, frame_tx));
        Harness {
            supervisor,
            store,
            connection,
            control_rx,
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(payload) = frame {
                events.push(serde_json::from_str(&payload).unwrap());
            }
        }
        events
    }

    #[tokio::test]
    async fn authentication_success_and_failure() {
        let mut h = harness(vec![]);
        assert!(h.supervisor.authenticate(&h.connection, "token").await);
        assert!(h.connection.is_authenticated());
        assert!(!h.supervisor.authenticate(&h.connection, "wrong").await);

        let events = drain_events(&mut h.control_rx);
        assert_eq!(events[0]["type"], "authentication");
        assert_eq!(events[0]["status"], "success");
        assert_eq!(events[1]["status"], "failed");
    }

    #[tokio::test]
    async fn live_run_persists_before_completion() {
        let mut h = harness(vec![
            ModelReply {
                text: "opening the page".into(),
                call: Some(FunctionCall {
                    name: "handle_url".into(),
                    args: json!({
                        "url": "https://example.com",
                        "action": "navigate",
                        "explanation": "open target",
                    }),
                }),
            },
            ModelReply {
                text: "The heading is Example Domain".into(),
                call: None,
            },
        ]);
        h.store.insert_run(Run::new("run-1", "user-a", "report the heading"));
        h.supervisor.authenticate(&h.connection, "token").await;

        let close = h
            .supervisor
            .clone()
            .run_live(
                h.connection.clone(),
                "run-1".into(),
                CancellationToken::new(),
            )
            .await;
        assert!(!close);

        // Terminal state persisted with the trace.
        let run = h.store.fetch_run("user-a", "run-1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(
            run.final_answer.as_deref(),
            Some("The heading is Example Domain")
        );
        assert_eq!(run.trace.len(), 1);
        assert_eq!(run.steps.len(), 1);

        let events = drain_events(&mut h.control_rx);
        let kinds: Vec<&str> = events
            .iter()
            .map(|event| event["type"].as_str().unwrap())
            .collect();
        // authentication, one step_update, exactly one completion
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == "completion")
                .count(),
            1
        );
        assert!(kinds.contains(&"step_update"));
        let completion = events
            .iter()
            .find(|event| event["type"] == "completion")
            .unwrap();
        assert_eq!(completion["status"], "completed");
        assert_eq!(completion["finalAnswer"], "The heading is Example Domain");
    }

    #[tokio::test]
    async fn terminal_run_is_served_from_the_record_and_closes() {
        let mut h = harness(vec![]);
        let mut run = Run::new("run-done", "user-a", "already finished");
        run.status = RunStatus::Completed;
        run.final_answer = Some("42".into());
        run.steps = vec![crate::types::Step {
            number: 1,
            action: "navigate".into(),
            explanation: "opened".into(),
        }];
        run.trace = vec![Command::Navigate {
            url: "https://example.com".into(),
        }];
        h.store.insert_run(run);
        h.supervisor.authenticate(&h.connection, "token").await;

        let close = h
            .supervisor
            .clone()
            .run_live(
                h.connection.clone(),
                "run-done".into(),
                CancellationToken::new(),
            )
            .await;
        assert!(close);

        let events = drain_events(&mut h.control_rx);
        let completion = events
            .iter()
            .find(|event| event["type"] == "completion")
            .unwrap();
        assert_eq!(completion["finalAnswer"], "42");
        assert_eq!(completion["commands"][0]["type"], "navigate");
    }

    #[tokio::test]
    async fn unknown_run_emits_error() {
        let mut h = harness(vec![]);
        h.supervisor.authenticate(&h.connection, "token").await;
        h.supervisor
            .clone()
            .run_live(
                h.connection.clone(),
                "missing".into(),
                CancellationToken::new(),
            )
            .await;
        let events = drain_events(&mut h.control_rx);
        assert!(events.iter().any(|event| event["type"] == "error"));
    }

    #[tokio::test]
    async fn unauthenticated_dispatch_is_rejected() {
        let mut h = harness(vec![]);
        let close = h
            .supervisor
            .clone()
            .run_live(
                h.connection.clone(),
                "run-1".into(),
                CancellationToken::new(),
            )
            .await;
        assert!(close);
        let events = drain_events(&mut h.control_rx);
        assert_eq!(events[0]["type"], "error");
    }

    #[tokio::test]
    async fn replay_completes_with_message() {
        let mut h = harness(vec![ModelReply {
            text: "Final page shows search results.".into(),
            call: None,
        }]);
        h.store.insert_automation(Automation {
            id: "auto-1".into(),
            user_id: "user-a".into(),
            name: "search".into(),
            objective: "find detergent".into(),
            trace: vec![Command::Scroll],
        });
        // Fast grace for the test.
        h.supervisor.authenticate(&h.connection, "token").await;

        h.supervisor
            .clone()
            .run_replay(
                h.connection.clone(),
                "auto-1".into(),
                CancellationToken::new(),
            )
            .await;

        let events = drain_events(&mut h.control_rx);
        let kinds: Vec<&str> = events
            .iter()
            .map(|event| event["type"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"step_started"));
        assert!(kinds.contains(&"step_completed"));
        let completion = events
            .iter()
            .find(|event| event["type"] == "completion")
            .unwrap();
        assert_eq!(completion["status"], "completed");
        assert_eq!(completion["message"], "Final page shows search results.");
    }

    #[tokio::test]
    async fn cancelled_run_stays_in_progress() {
        let mut h = harness(vec![]);
        h.store.insert_run(Run::new("run-1", "user-a", "objective"));
        h.supervisor.authenticate(&h.connection, "token").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        h.supervisor
            .clone()
            .run_live(h.connection.clone(), "run-1".into(), cancel)
            .await;

        let run = h.store.fetch_run("user-a", "run-1").await.unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        let events = drain_events(&mut h.control_rx);
        assert!(!events.iter().any(|event| event["type"] == "completion"));
    }

    #[test]
    fn session_registry_tracks_cancellation() {
        let h = harness(vec![]);
        let cancel = CancellationToken::new();
        h.supervisor.register_session("s1", cancel.clone());
        assert_eq!(h.supervisor.active_sessions(), 1);
        h.supervisor.cancel_all();
        assert!(cancel.is_cancelled());
        h.supervisor.unregister_session("s1");
        assert_eq!(h.supervisor.active_sessions(), 0);
    }
}
