//! Named actions the language model may request.
//!
//! Tools are the only bridge between the model and the browser. Each
//! tool validates its arguments before touching the page, executes one
//! typed browser operation, and yields the command recorded in the
//! trace. The registry resolves the function name in a model reply to
//! its handler; there is no reflection anywhere.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::browser::{Browser, ScrollDirection};
use crate::captcha::{self, SolveReport};
use crate::errors::ToolError;
use crate::llm::LanguageModel;
use crate::types::Command;

/// Shared execution context handed to every tool. The browser mutex is
/// the per-session lock that also guards the screenshot pump.
#[derive(Clone)]
pub struct ToolContext {
    pub browser: Arc<Mutex<Browser>>,
    pub vision: Arc<dyn LanguageModel>,
}

/// Result of one tool execution.
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub command: Command,
    pub detail: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// JSON-Schema function declaration advertised to the model.
    fn schema(&self) -> Value;

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;
}

/// Registry of the standard tool set.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn standard() -> Self {
        Self {
            tools: vec![
                Arc::new(UrlTool),
                Arc::new(SearchTool),
                Arc::new(ClickTool),
                Arc::new(TypingTool { with_enter: false }),
                Arc::new(TypingTool { with_enter: true }),
                Arc::new(ScrollTool),
                Arc::new(BackTool),
                Arc::new(CaptchaTool),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name).cloned()
    }

    /// Function declarations for the model request, in registry order.
    pub fn declarations(&self) -> Vec<Value> {
        self.tools.iter().map(|tool| tool.schema()).collect()
    }

    pub async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        debug!(tool = name, "dispatching tool");
        tool.execute(args, ctx).await
    }

    /// Execute a recorded command through the same tool path used live.
    pub async fn dispatch_command(
        &self,
        command: &Command,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, ToolError> {
        let (name, args) = wire_shape(command);
        self.dispatch(name, &args, ctx).await
    }
}

/// Tool name and argument object equivalent to a recorded command.
fn wire_shape(command: &Command) -> (&'static str, Value) {
    match command {
        Command::Navigate { url } => ("handle_url", json!({ "url": url })),
        Command::Search { query } => ("handle_search", json!({ "query": query })),
        Command::Click { identifier } => ("handle_click", json!({ "identifier": identifier })),
        Command::Type { placeholder, text } => (
            "handle_typing",
            json!({ "placeholder_value": placeholder, "text": text }),
        ),
        Command::TypeAndEnter { placeholder, text } => (
            "handle_typing_with_enter",
            json!({ "placeholder_value": placeholder, "text": text }),
        ),
        Command::Scroll => ("handle_scroll", json!({})),
        Command::Back => ("handle_back", json!({})),
        Command::SolveCaptcha => ("handle_captcha", json!({})),
    }
}

fn string_arg(args: &Value, key: &str, tool: &'static str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ToolError::InvalidArgs {
            tool,
            reason: format!("missing or empty '{key}'"),
        })
}

/// Properties every declaration carries so the model can narrate steps.
fn with_common_properties(mut properties: Value) -> Value {
    let map = properties.as_object_mut().expect("properties object");
    map.insert(
        "explanation".into(),
        json!({ "type": "string", "description": "Why this action advances the objective" }),
    );
    map.insert(
        "action".into(),
        json!({ "type": "string", "description": "Short label for this action" }),
    );
    properties
}

fn declaration(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "name": name,
        "description": description,
        "parameters": {
            "type": "object",
            "properties": with_common_properties(properties),
            "required": required,
        },
    })
}

struct UrlTool;

#[async_trait]
impl Tool for UrlTool {
    fn name(&self) -> &'static str {
        "handle_url"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Navigate the browser to an absolute URL",
            json!({ "url": { "type": "string", "description": "Absolute http(s) URL" } }),
            &["url"],
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let url = string_arg(args, "url", self.name())?;
        Url::parse(&url).map_err(|err| ToolError::InvalidArgs {
            tool: self.name(),
            reason: format!("url must be absolute: {err}"),
        })?;

        let browser = ctx.browser.lock().await;
        retry_transient(|| browser.navigate(&url)).await?;
        Ok(ToolOutcome {
            command: Command::Navigate { url: url.clone() },
            detail: format!("navigated to {url}"),
        })
    }
}

struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "handle_search"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Type a query into the page's search input and submit it",
            json!({ "query": { "type": "string", "description": "Search query text" } }),
            &["query"],
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let query = string_arg(args, "query", self.name())?;
        let browser = ctx.browser.lock().await;
        browser.search(&query).await?;
        Ok(ToolOutcome {
            command: Command::Search {
                query: query.clone(),
            },
            detail: format!("searched for '{query}'"),
        })
    }
}

struct ClickTool;

#[async_trait]
impl Tool for ClickTool {
    fn name(&self) -> &'static str {
        "handle_click"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Click the element matching a visible text or numbered label",
            json!({ "identifier": {
                "type": "string",
                "description": "Visible text of the element, or its yellow badge number",
            } }),
            &["identifier"],
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let identifier = string_arg(args, "identifier", self.name())?;
        let browser = ctx.browser.lock().await;
        retry_transient(|| browser.click(&identifier)).await?;
        Ok(ToolOutcome {
            command: Command::Click {
                identifier: identifier.clone(),
            },
            detail: format!("clicked '{identifier}'"),
        })
    }
}

struct TypingTool {
    with_enter: bool,
}

#[async_trait]
impl Tool for TypingTool {
    fn name(&self) -> &'static str {
        if self.with_enter {
            "handle_typing_with_enter"
        } else {
            "handle_typing"
        }
    }

    fn schema(&self) -> Value {
        let description = if self.with_enter {
            "Type text into the matched input field and press Enter"
        } else {
            "Type text into the matched input field"
        };
        declaration(
            self.name(),
            description,
            json!({
                "placeholder_value": {
                    "type": "string",
                    "description": "Placeholder, label, name, or id of the target field",
                },
                "text": { "type": "string", "description": "Text to type" },
            }),
            &["placeholder_value", "text"],
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let placeholder = string_arg(args, "placeholder_value", self.name())?;
        let text = string_arg(args, "text", self.name())?;

        let browser = ctx.browser.lock().await;
        browser
            .type_text(&placeholder, &text, self.with_enter)
            .await?;

        let command = if self.with_enter {
            Command::TypeAndEnter {
                placeholder: placeholder.clone(),
                text: text.clone(),
            }
        } else {
            Command::Type {
                placeholder: placeholder.clone(),
                text: text.clone(),
            }
        };
        Ok(ToolOutcome {
            command,
            detail: format!("typed '{text}' into '{placeholder}'"),
        })
    }
}

struct ScrollTool;

#[async_trait]
impl Tool for ScrollTool {
    fn name(&self) -> &'static str {
        "handle_scroll"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Scroll the page; defaults to one viewport down",
            json!({
                "direction": { "type": "string", "enum": ["up", "down"] },
                "amount": { "type": "integer", "description": "Pixels to scroll" },
            }),
            &[],
        )
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let direction = match args.get("direction").and_then(Value::as_str) {
            Some("up") => ScrollDirection::Up,
            Some("down") | None => ScrollDirection::Down,
            Some(other) => {
                return Err(ToolError::InvalidArgs {
                    tool: self.name(),
                    reason: format!("unknown direction '{other}'"),
                })
            }
        };
        let amount = args
            .get("amount")
            .and_then(Value::as_u64)
            .map(|value| value as u32);

        let browser = ctx.browser.lock().await;
        browser.scroll(direction, amount).await?;
        Ok(ToolOutcome {
            command: Command::Scroll,
            detail: "scrolled".into(),
        })
    }
}

struct BackTool;

#[async_trait]
impl Tool for BackTool {
    fn name(&self) -> &'static str {
        "handle_back"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Go back one entry in the browser history",
            json!({}),
            &[],
        )
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let browser = ctx.browser.lock().await;
        browser.back().await?;
        Ok(ToolOutcome {
            command: Command::Back,
            detail: "went back".into(),
        })
    }
}

struct CaptchaTool;

#[async_trait]
impl Tool for CaptchaTool {
    fn name(&self) -> &'static str {
        "handle_captcha"
    }

    fn schema(&self) -> Value {
        declaration(
            self.name(),
            "Detect and solve a captcha on the current page",
            json!({}),
            &[],
        )
    }

    async fn execute(&self, _args: &Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError> {
        let browser = ctx.browser.lock().await;
        let report = captcha::solve_if_present(&browser, ctx.vision.as_ref()).await?;
        let detail = match &report {
            SolveReport::NotPresent => "no captcha on the page".to_string(),
            SolveReport::Solved { strategy } => format!("captcha solved via {strategy}"),
        };
        Ok(ToolOutcome {
            command: Command::SolveCaptcha,
            detail,
        })
    }
}

/// Retry a browser operation once when the failure class is transient.
async fn retry_transient<F, Fut>(operation: F) -> Result<(), ToolError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), crate::errors::BrowserError>>,
{
    match operation().await {
        Ok(()) => Ok(()),
        Err(err) if err.is_transient() => {
            debug!(%err, "transient browser failure, retrying once");
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            operation().await.map_err(ToolError::from)
        }
        Err(err) => Err(ToolError::from(err)),
    }
}
