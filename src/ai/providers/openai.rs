//! OpenAI Chat Completions API adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::ai::provider::{LLMProvider, ProviderError};
use crate::ai::types::{ChatMessage, LLMResponse, Role, ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// LLM provider backed by the OpenAI Chat Completions API.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            default_model: default_model.into(),
        }
    }

    /// Override the API base URL (used by tests and proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

// ─── Message translation ───────────────────────────────────────────────────

/// Translate neutral messages to OpenAI wire format.  System messages pass
/// through; assistant tool calls use the `function` shape with JSON-encoded
/// arguments; tool results keep role `tool`.
pub fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            },
                        })
                    })
                    .collect();
                json!({
                    "role": "assistant",
                    "content": msg.content.clone().unwrap_or_default(),
                    "tool_calls": calls,
                })
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content.clone().unwrap_or_default(),
            }),
            _ => json!({
                "role": msg.role.as_str(),
                "content": msg.content.clone().unwrap_or_default(),
            }),
        })
        .collect()
}

// ─── Wire types ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        model: Option<&str>,
    ) -> Result<LLMResponse, ProviderError> {
        let translated = messages_to_openai(messages);

        let mut body = json!({
            "model": model.unwrap_or(&self.default_model),
            "messages": translated,
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.to_vec());
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode("response contained no choices".into()))?;

        let mut tool_calls: Vec<ToolCall> = Vec::new();
        if let Some(calls) = choice.message.tool_calls {
            for tc in calls {
                let arguments: Value = serde_json::from_str(&tc.function.arguments)
                    .map_err(|e| {
                        ProviderError::Decode(format!(
                            "tool call {} has malformed arguments: {e}",
                            tc.id
                        ))
                    })?;
                tool_calls.push(ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                });
            }
        }

        let usage = parsed.usage.map_or_else(Usage::default, |u| {
            Usage::new(u.prompt_tokens, u.completion_tokens)
        });

        Ok(LLMResponse {
            content: choice.message.content,
            tool_calls,
            stop_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_owned()),
            usage,
            model: parsed.model,
            raw_blocks: None,
        })
    }
}
