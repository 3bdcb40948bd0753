//! Deterministic replay of a recorded trace.
//!
//! Commands execute in order through the same tool set used live, with
//! the captcha pre-check ahead of every command. Any command failure
//! aborts the replay; there are no retries beyond the ones inside the
//! tools themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::Browser;
use crate::captcha;
use crate::errors::LlmError;
use crate::events::{EventSink, ServerEvent};
use crate::llm::{LanguageModel, ModelReply, Turn};
use crate::metrics;
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::Automation;

const SUMMARY_SYSTEM_PROMPT: &str = "You are reviewing the final screenshot of an \
automated browser script. In one or two sentences, summarize what the page shows \
in relation to the script's objective.";

const NEUTRAL_COMPLETION: &str = "completed successfully";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplayOutcome {
    Completed { message: String },
    Failed { reason: String },
    Cancelled,
}

pub struct Replayer {
    automation: Automation,
    browser: Arc<Mutex<Browser>>,
    vision: Option<Arc<dyn LanguageModel>>,
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    step_grace: Duration,
}

impl Replayer {
    pub fn new(
        automation: Automation,
        browser: Arc<Mutex<Browser>>,
        vision: Option<Arc<dyn LanguageModel>>,
        registry: Arc<ToolRegistry>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
        step_grace: Duration,
    ) -> Self {
        Self {
            automation,
            browser,
            vision,
            registry,
            sink,
            cancel,
            step_grace,
        }
    }

    pub async fn run(&self) -> ReplayOutcome {
        info!(
            automation_id = %self.automation.id,
            commands = self.automation.trace.len(),
            "replay starting"
        );

        let vision: Arc<dyn LanguageModel> = self
            .vision
            .clone()
            .unwrap_or_else(|| Arc::new(DisabledModel));
        let tool_ctx = ToolContext {
            browser: self.browser.clone(),
            vision: vision.clone(),
        };

        for (index, command) in self.automation.trace.iter().enumerate() {
            let number = index as u32 + 1;
            if self.cancel.is_cancelled() {
                return ReplayOutcome::Cancelled;
            }

            // Captcha guard runs before every command, exactly as live.
            if self.vision.is_some() {
                let browser = self.browser.lock().await;
                if let Err(err) =
                    captcha::precheck(&browser, vision.as_ref(), self.sink.as_ref()).await
                {
                    drop(browser);
                    warn!(number, %err, "captcha blocked replay");
                    metrics::record_replay_command("captcha_failed");
                    return ReplayOutcome::Failed {
                        reason: format!("captcha blocked command {number}: {err}"),
                    };
                }
            }

            self.sink.emit(ServerEvent::StepStarted { number });

            let dispatched = tokio::select! {
                _ = self.cancel.cancelled() => return ReplayOutcome::Cancelled,
                result = self.registry.dispatch_command(command, &tool_ctx) => result,
            };
            if let Err(err) = dispatched {
                warn!(number, command = command.label(), %err, "replay command failed");
                metrics::record_replay_command("failed");
                return ReplayOutcome::Failed {
                    reason: format!("command {number} ({}) failed: {err}", command.label()),
                };
            }

            metrics::record_replay_command("ok");
            self.sink.emit(ServerEvent::StepCompleted { number });

            // Stability grace between commands.
            tokio::time::sleep(self.step_grace).await;
        }

        let message = self.summarize().await;
        info!(automation_id = %self.automation.id, "replay completed");
        ReplayOutcome::Completed { message }
    }

    /// Final screenshot to the vision model for a closing summary; a
    /// neutral message when no model is configured or the call fails.
    async fn summarize(&self) -> String {
        let Some(vision) = self.vision.clone() else {
            return NEUTRAL_COMPLETION.to_string();
        };

        let shot = {
            let browser = self.browser.lock().await;
            browser.screenshot_raw().await
        };
        let Ok(shot) = shot else {
            return NEUTRAL_COMPLETION.to_string();
        };

        let question = format!(
            "Script '{}' with objective '{}' just finished. Summarize the final page.",
            self.automation.name, self.automation.objective
        );
        match crate::llm::describe_image(vision.as_ref(), SUMMARY_SYSTEM_PROMPT, &question, &shot)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => NEUTRAL_COMPLETION.to_string(),
            Err(err) => {
                warn!(%err, "replay summary model call failed");
                NEUTRAL_COMPLETION.to_string()
            }
        }
    }
}

/// Stand-in model for replays configured without vision; captcha
/// strategies that need it fail cleanly.
struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    async fn generate(
        &self,
        _turns: &[Turn],
        _tools: Option<&[serde_json::Value]>,
    ) -> Result<ModelReply, LlmError> {
        Err(LlmError::Http("no vision model configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ScriptedTransport;
    use crate::config::BrowserLaunchConfig;
    use crate::events::RecordingSink;
    use crate::llm::ScriptedModel;
    use crate::types::Command;
    use serde_json::json;

    fn scripted_browser(click_fails: bool) -> Arc<Mutex<Browser>> {
        let transport = Arc::new(ScriptedTransport::new(Box::new(move |method, params| {
            match method {
                "Page.captureScreenshot" => Ok(json!({ "data": "ZmluYWw=" })),
                "Runtime.evaluate" => {
                    let expr = params["expression"].as_str().unwrap_or_default();
                    if expr.contains("readyState") {
                        Ok(json!({ "result": { "value": "complete" } }))
                    } else if expr.contains("recaptcha/enterprise/anchor") {
                        Ok(json!({ "result": { "value": "{\"kind\":null}" } }))
                    } else if expr.contains("isVisible") {
                        if click_fails {
                            Ok(json!({ "result": { "value": "{\"found\":false}" } }))
                        } else {
                            Ok(json!({ "result": { "value": "{\"found\":true,\"x\":4.0,\"y\":4.0}" } }))
                        }
                    } else {
                        Ok(json!({ "result": { "value": "" } }))
                    }
                }
                _ => Ok(json!({})),
            }
        })));
        Arc::new(Mutex::new(Browser::new(
            transport,
            BrowserLaunchConfig {
                settle_ms: 0,
                ..BrowserLaunchConfig::default()
            },
        )))
    }

    fn automation(trace: Vec<Command>) -> Automation {
        Automation {
            id: "auto-1".into(),
            user_id: "user-a".into(),
            name: "amazon search".into(),
            objective: "search for detergent".into(),
            trace,
        }
    }

    fn replayer(
        trace: Vec<Command>,
        browser: Arc<Mutex<Browser>>,
        vision: Option<Arc<dyn LanguageModel>>,
        sink: Arc<RecordingSink>,
    ) -> Replayer {
        Replayer::new(
            automation(trace),
            browser,
            vision,
            Arc::new(ToolRegistry::standard()),
            sink,
            CancellationToken::new(),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn replays_commands_in_order_with_events() {
        let trace = vec![
            Command::Navigate {
                url: "https://amazon.com".into(),
            },
            Command::TypeAndEnter {
                placeholder: "Search Amazon".into(),
                text: "detergent".into(),
            },
        ];
        let sink = Arc::new(RecordingSink::new());
        let outcome = replayer(trace, scripted_browser(false), None, sink.clone())
            .run()
            .await;

        assert_eq!(
            outcome,
            ReplayOutcome::Completed {
                message: NEUTRAL_COMPLETION.into()
            }
        );

        let markers: Vec<String> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::StepStarted { number } => Some(format!("start-{number}")),
                ServerEvent::StepCompleted { number } => Some(format!("done-{number}")),
                _ => None,
            })
            .collect();
        assert_eq!(markers, vec!["start-1", "done-1", "start-2", "done-2"]);
    }

    #[tokio::test]
    async fn command_failure_aborts_the_replay() {
        let trace = vec![
            Command::Click {
                identifier: "Ghost Button".into(),
            },
            Command::Scroll,
        ];
        let sink = Arc::new(RecordingSink::new());
        let outcome = replayer(trace, scripted_browser(true), None, sink.clone())
            .run()
            .await;

        assert!(matches!(outcome, ReplayOutcome::Failed { .. }));
        let started: Vec<u32> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::StepStarted { number } => Some(number),
                _ => None,
            })
            .collect();
        // The second command never starts.
        assert_eq!(started, vec![1]);
    }

    #[tokio::test]
    async fn vision_model_writes_the_completion_message() {
        let trace = vec![Command::Scroll];
        let sink = Arc::new(RecordingSink::new());
        let vision: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![ModelReply {
            text: "The results page lists detergent offers.".into(),
            call: None,
        }]));
        let outcome = replayer(trace, scripted_browser(false), Some(vision), sink)
            .run()
            .await;

        assert_eq!(
            outcome,
            ReplayOutcome::Completed {
                message: "The results page lists detergent offers.".into()
            }
        );
    }

    #[tokio::test]
    async fn summary_model_failure_falls_back_to_neutral() {
        let trace = vec![Command::Scroll];
        let sink = Arc::new(RecordingSink::new());
        // Scripted model with no replies errors on the summary call.
        let vision: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![]));
        let outcome = replayer(trace, scripted_browser(false), Some(vision), sink)
            .run()
            .await;
        assert_eq!(
            outcome,
            ReplayOutcome::Completed {
                message: NEUTRAL_COMPLETION.into()
            }
        );
    }

    #[tokio::test]
    async fn unsolvable_captcha_aborts_the_replay() {
        let transport = Arc::new(ScriptedTransport::new(Box::new(|method, params| {
            match method {
                "Page.captureScreenshot" => Ok(json!({ "data": "c2hvdA==" })),
                "Runtime.evaluate" => {
                    let expr = params["expression"].as_str().unwrap_or_default();
                    if expr.contains("recaptcha/enterprise/anchor") {
                        Ok(json!({ "result": { "value":
                            "{\"kind\":\"text\",\"selector\":\".captcha\",\"x\":1.0,\"y\":1.0}" } }))
                    } else if expr.contains("location.host") {
                        Ok(json!({ "result": { "value": "blocked.example" } }))
                    } else if expr.contains("isVisible") {
                        Ok(json!({ "result": { "value": "{\"found\":false}" } }))
                    } else {
                        Ok(json!({ "result": { "value": "" } }))
                    }
                }
                _ => Ok(json!({})),
            }
        })));
        let browser = Arc::new(Mutex::new(Browser::new(
            transport,
            BrowserLaunchConfig {
                settle_ms: 0,
                ..BrowserLaunchConfig::default()
            },
        )));

        // One reply for the text-captcha strategy; it carries no JSON,
        // so every strategy dead-ends.
        let vision: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new(vec![ModelReply {
            text: "unreadable".into(),
            call: None,
        }]));
        let sink = Arc::new(RecordingSink::new());
        let replayer = Replayer::new(
            automation(vec![Command::Scroll]),
            browser,
            Some(vision),
            Arc::new(ToolRegistry::standard()),
            sink.clone(),
            CancellationToken::new(),
            Duration::ZERO,
        );

        let outcome = replayer.run().await;
        let ReplayOutcome::Failed { reason } = outcome else {
            panic!("expected captcha failure");
        };
        assert!(reason.contains("captcha"));

        // The blocked command never started.
        assert!(!sink
            .events()
            .iter()
            .any(|event| matches!(event, ServerEvent::StepStarted { .. })));
        assert!(sink
            .events()
            .iter()
            .any(|event| matches!(event, ServerEvent::CaptchaDetected)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_replay() {
        let trace = vec![Command::Scroll, Command::Scroll];
        let sink = Arc::new(RecordingSink::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let replayer = Replayer::new(
            automation(trace),
            scripted_browser(false),
            None,
            Arc::new(ToolRegistry::standard()),
            sink,
            cancel,
            Duration::ZERO,
        );
        assert_eq!(replayer.run().await, ReplayOutcome::Cancelled);
    }
}
