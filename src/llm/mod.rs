//! Language-model capability.
//!
//! The decision loop and the captcha solver talk to one trait; the
//! concrete client lives in [`gemini`]. Conversations are ordered turns
//! of text and inline JPEG parts.

pub mod gemini;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::LlmError;

pub use gemini::{GeminiClient, GeminiConfig};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    System,
    User,
    Model,
}

#[derive(Clone, Debug)]
pub enum Part {
    Text(String),
    /// Base64-encoded image payload.
    InlineImage { mime: String, data: String },
}

#[derive(Clone, Debug)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn with_image(mut self, mime: impl Into<String>, data: impl Into<String>) -> Self {
        self.parts.push(Part::InlineImage {
            mime: mime.into(),
            data: data.into(),
        });
        self
    }

    /// Concatenated text content of the turn.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::InlineImage { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug)]
pub struct FunctionCall {
    pub name: String,
    pub args: Value,
}

/// One model reply: free text plus at most one tool call.
#[derive(Clone, Debug, Default)]
pub struct ModelReply {
    pub text: String,
    pub call: Option<FunctionCall>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate the next reply for a conversation. When `tools` is
    /// given, the model may answer with a function call instead of (or
    /// alongside) text.
    async fn generate(
        &self,
        turns: &[Turn],
        tools: Option<&[Value]>,
    ) -> Result<ModelReply, LlmError>;
}

/// Ask the model a single vision question over one image. Shared by the
/// captcha solver and the replay summarizer.
pub async fn describe_image(
    model: &dyn LanguageModel,
    system: &str,
    question: &str,
    jpeg_base64: &str,
) -> Result<String, LlmError> {
    let turns = vec![
        Turn::text(Role::System, system),
        Turn::text(Role::User, question).with_image("image/jpeg", jpeg_base64),
    ];
    let reply = model.generate(&turns, None).await?;
    Ok(reply.text)
}

/// Scripted model used by tests: pops pre-seeded replies in order.
pub struct ScriptedModel {
    replies: parking_lot::Mutex<std::collections::VecDeque<ModelReply>>,
    pub requests: parking_lot::Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: parking_lot::Mutex::new(replies.into()),
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        turns: &[Turn],
        _tools: Option<&[Value]>,
    ) -> Result<ModelReply, LlmError> {
        self.requests.lock().push(turns.len());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| LlmError::Malformed("scripted model exhausted".into()))
    }
}
