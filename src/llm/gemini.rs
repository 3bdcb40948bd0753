//! REST client for a Gemini-style `generateContent` API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::LlmConfig;
use crate::errors::LlmError;

use super::{FunctionCall, LanguageModel, ModelReply, Part, Role, Turn};

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl From<&LlmConfig> for GeminiConfig {
    fn from(config: &LlmConfig) -> Self {
        Self {
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::Http("missing model API key".into()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| LlmError::Http(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(
        &self,
        turns: &[Turn],
        tools: Option<&[Value]>,
    ) -> Result<ModelReply, LlmError> {
        let body = GenerateRequest::from_turns(turns, tools);

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Http(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            warn!(status = status.as_u16(), body = %body, "model returned error status");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::Malformed(format!("response decode failed: {err}")))?;

        envelope.into_reply()
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDecl>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize)]
struct ToolDecl {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<Value>,
}

impl GenerateRequest {
    fn from_turns(turns: &[Turn], tools: Option<&[Value]>) -> Self {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for turn in turns {
            let parts = turn
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text(text) => WirePart {
                        text: Some(text.clone()),
                        inline_data: None,
                        function_call: None,
                    },
                    Part::InlineImage { mime, data } => WirePart {
                        text: None,
                        inline_data: Some(InlineData {
                            mime_type: mime.clone(),
                            data: data.clone(),
                        }),
                        function_call: None,
                    },
                })
                .collect();

            match turn.role {
                Role::System => {
                    system_instruction = Some(Content { role: None, parts });
                }
                Role::User => contents.push(Content {
                    role: Some("user".into()),
                    parts,
                }),
                Role::Model => contents.push(Content {
                    role: Some("model".into()),
                    parts,
                }),
            }
        }

        Self {
            contents,
            system_instruction,
            tools: tools.map(|declarations| {
                vec![ToolDecl {
                    function_declarations: declarations.to_vec(),
                }]
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    fn into_reply(self) -> Result<ModelReply, LlmError> {
        let content = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .ok_or_else(|| LlmError::Malformed("response missing candidates".into()))?;

        let mut reply = ModelReply::default();
        let mut texts = Vec::new();
        for part in content.parts {
            if let Some(text) = part.text {
                texts.push(text);
            }
            if let Some(call) = part.function_call {
                if reply.call.is_none() {
                    reply.call = Some(FunctionCall {
                        name: call.name,
                        args: call.args,
                    });
                }
            }
        }
        reply.text = texts.join("\n");

        if reply.text.is_empty() && reply.call.is_none() {
            return Err(LlmError::Malformed("response carried no usable parts".into()));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shape_separates_system_instruction() {
        let turns = vec![
            Turn::text(Role::System, "you are a browser agent"),
            Turn::text(Role::User, "open example.com").with_image("image/jpeg", "QUJD"),
        ];
        let request = GenerateRequest::from_turns(&turns, Some(&[json!({"name": "handle_url"})]));
        let value = serde_json::to_value(&request).unwrap();

        assert!(value["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("browser agent"));
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(
            value["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            "image/jpeg"
        );
        assert_eq!(
            value["tools"][0]["functionDeclarations"][0]["name"],
            "handle_url"
        );
    }

    #[test]
    fn reply_extracts_first_function_call() {
        let envelope: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "clicking the login button"},
                        {"functionCall": {"name": "handle_click", "args": {"identifier": "Login"}}}
                    ]
                }
            }]
        }))
        .unwrap();
        let reply = envelope.into_reply().unwrap();
        assert_eq!(reply.text, "clicking the login button");
        let call = reply.call.unwrap();
        assert_eq!(call.name, "handle_click");
        assert_eq!(call.args["identifier"], "Login");
    }

    #[test]
    fn empty_candidates_are_malformed() {
        let envelope: GenerateResponse = serde_json::from_value(json!({"candidates": []})).unwrap();
        assert!(matches!(envelope.into_reply(), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn missing_key_rejected_at_build() {
        let config = GeminiConfig {
            api_base: "https://example.invalid".into(),
            api_key: "  ".into(),
            model: "gemini-2.0-flash".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(GeminiClient::new(config).is_err());
    }
}
