//! Error taxonomy for the agent engine.
//!
//! Each capability seam carries its own typed error; the application
//! layers compose them and decide what is fatal per mode (a failed step
//! keeps a live run going but aborts a replay).

use thiserror::Error;

/// Failures surfaced by the browser capability.
#[derive(Clone, Debug, Error)]
pub enum BrowserError {
    #[error("navigation timed out: {0}")]
    NavTimeout(String),
    #[error("devtools i/o failure: {0}")]
    Io(String),
    #[error("target element not found: {0}")]
    TargetNotFound(String),
    #[error("page script failed: {0}")]
    ScriptFailed(String),
    #[error("frame not found: {0}")]
    FrameNotFound(String),
    #[error("browser closed")]
    Closed,
}

impl BrowserError {
    /// Transient failures are worth an in-tool retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrowserError::NavTimeout(_) | BrowserError::Io(_))
    }
}

/// Failures from the language-model client.
#[derive(Clone, Debug, Error)]
pub enum LlmError {
    #[error("model request failed: {0}")]
    Http(String),
    #[error("model returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model reply malformed: {0}")]
    Malformed(String),
    #[error("model request timed out")]
    Timeout,
}

/// Failures from the captcha handler.
#[derive(Clone, Debug, Error)]
pub enum CaptchaError {
    #[error("captcha unsolvable: {0}")]
    Unsolvable(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Model(#[from] LlmError),
}

/// Failures from tool dispatch.
#[derive(Clone, Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: &'static str, reason: String },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Captcha(#[from] CaptchaError),
}

/// Failures from the store capability.
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("run {0} is terminal and immutable")]
    Terminal(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Failures terminating or steering the decision loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model repeated itself; a different approach is required")]
    Repetition,
    #[error("max steps reached without completion")]
    MaxSteps,
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session cancelled")]
    Cancelled,
}

/// Failures from the token verifier.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("verifier unreachable: {0}")]
    Unreachable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_browser_errors() {
        assert!(BrowserError::NavTimeout("goto".into()).is_transient());
        assert!(BrowserError::Io("socket".into()).is_transient());
        assert!(!BrowserError::TargetNotFound("#x".into()).is_transient());
        assert!(!BrowserError::Closed.is_transient());
    }

    #[test]
    fn tool_error_wraps_browser_error() {
        let err: ToolError = BrowserError::Closed.into();
        assert!(matches!(err, ToolError::Browser(BrowserError::Closed)));
    }
}
