//! Anthropic Messages API adapter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::ai::provider::{LLMProvider, ProviderError};
use crate::ai::types::{ChatMessage, LLMResponse, Role, ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// LLM provider backed by the Anthropic Messages API.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
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

/// Extract the system prompt and translate neutral messages to Anthropic
/// wire format.  Returns `(system_prompt, translated_messages)`.
pub fn messages_to_anthropic(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut translated: Vec<Value> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                if let Some(content) = &msg.content {
                    system_parts.push(content);
                }
            }
            Role::Assistant if msg.raw_blocks.is_some() => {
                // Raw provider blocks (e.g. server-side web search results)
                // are re-emitted verbatim.
                translated.push(json!({
                    "role": "assistant",
                    "content": msg.raw_blocks.clone(),
                }));
            }
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(content) = &msg.content {
                    if !content.is_empty() {
                        blocks.push(json!({"type": "text", "text": content}));
                    }
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                translated.push(json!({"role": "assistant", "content": blocks}));
            }
            Role::Tool => {
                translated.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content.clone().unwrap_or_default(),
                    }],
                }));
            }
            _ => {
                translated.push(json!({
                    "role": msg.role.as_str(),
                    "content": msg.content.clone().unwrap_or_default(),
                }));
            }
        }
    }

    (system_parts.join("\n\n"), translated)
}

// ─── Wire types ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<Value>,
    stop_reason: Option<String>,
    usage: ApiUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Parse the content blocks of a Messages response into text, tool calls,
/// and (when server-side tools ran) the raw blocks to echo back.
fn parse_content_blocks(
    blocks: &[Value],
) -> Result<(Option<String>, Vec<ToolCall>, Option<Value>), ProviderError> {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut has_server_tool = false;

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(text.to_owned());
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::Decode("tool_use block missing id".into()))?;
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::Decode("tool_use block missing name".into()))?;
                tool_calls.push(ToolCall {
                    id: id.to_owned(),
                    name: name.to_owned(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            Some("server_tool_use" | "web_search_tool_result") => {
                has_server_tool = true;
            }
            _ => {}
        }
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n\n"))
    };
    let raw_blocks = has_server_tool.then(|| Value::Array(blocks.to_vec()));
    Ok((content, tool_calls, raw_blocks))
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        model: Option<&str>,
    ) -> Result<LLMResponse, ProviderError> {
        let (system_prompt, translated) = messages_to_anthropic(messages);

        let mut body = json!({
            "model": model.unwrap_or(&self.default_model),
            "messages": translated,
            "max_tokens": DEFAULT_MAX_TOKENS,
        });
        if !system_prompt.is_empty() {
            body["system"] = json!([{
                "type": "text",
                "text": system_prompt,
                "cache_control": {"type": "ephemeral"},
            }]);
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                let mut tools_copy = tools.to_vec();
                // Cache breakpoint on the last tool schema.
                if let Some(Value::Object(last)) = tools_copy.last_mut() {
                    last.insert("cache_control".to_owned(), json!({"type": "ephemeral"}));
                }
                body["tools"] = Value::Array(tools_copy);
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        let (content, tool_calls, raw_blocks) = parse_content_blocks(&parsed.content)?;

        Ok(LLMResponse {
            content,
            tool_calls,
            stop_reason: parsed.stop_reason.unwrap_or_else(|| "end_turn".to_owned()),
            usage: Usage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
                cache_creation_input_tokens: parsed.usage.cache_creation_input_tokens,
                cache_read_input_tokens: parsed.usage.cache_read_input_tokens,
                cost_usd: 0.0,
            },
            model: parsed.model,
            raw_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_extracted_and_joined() {
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::system("second"),
            ChatMessage::user("hi"),
        ];
        let (system, translated) = messages_to_anthropic(&messages);
        assert_eq!(system, "first\n\nsecond");
        assert_eq!(translated.len(), 1);
        assert_eq!(translated[0]["role"], "user");
    }

    #[test]
    fn assistant_tool_calls_become_content_blocks() {
        let messages = vec![ChatMessage {
            role: Role::Assistant,
            content: Some("let me check".to_owned()),
            tool_calls: vec![ToolCall {
                id: "t1".to_owned(),
                name: "view".to_owned(),
                arguments: json!({"path": "a.txt"}),
            }],
            tool_call_id: None,
            raw_blocks: None,
        }];
        let (_, translated) = messages_to_anthropic(&messages);
        let blocks = translated[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["id"], "t1");
        assert_eq!(blocks[1]["input"]["path"], "a.txt");
    }

    #[test]
    fn tool_results_become_user_tool_result_blocks() {
        let messages = vec![ChatMessage::tool_result("t1", "file contents")];
        let (_, translated) = messages_to_anthropic(&messages);
        assert_eq!(translated[0]["role"], "user");
        let block = &translated[0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "t1");
        assert_eq!(block["content"], "file contents");
    }

    #[test]
    fn raw_blocks_pass_through_verbatim() {
        let raw = json!([
            {"type": "server_tool_use", "id": "s1", "name": "web_search"},
            {"type": "web_search_tool_result", "tool_use_id": "s1", "content": []},
        ]);
        let messages = vec![ChatMessage {
            role: Role::Assistant,
            content: Some("searching".to_owned()),
            tool_calls: vec![],
            tool_call_id: None,
            raw_blocks: Some(raw.clone()),
        }];
        let (_, translated) = messages_to_anthropic(&messages);
        assert_eq!(translated[0]["content"], raw);
    }

    #[test]
    fn parse_blocks_extracts_text_and_tool_use() {
        let blocks = vec![
            json!({"type": "text", "text": "hello"}),
            json!({"type": "tool_use", "id": "t1", "name": "bash", "input": {"command": "ls"}}),
        ];
        let (content, calls, raw) = parse_content_blocks(&blocks).unwrap();
        assert_eq!(content.as_deref(), Some("hello"));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
        assert!(raw.is_none());
    }

    #[test]
    fn server_tool_blocks_are_captured_raw() {
        let blocks = vec![
            json!({"type": "server_tool_use", "id": "s1", "name": "web_search", "input": {}}),
            json!({"type": "text", "text": "found it"}),
        ];
        let (content, calls, raw) = parse_content_blocks(&blocks).unwrap();
        assert_eq!(content.as_deref(), Some("found it"));
        assert!(calls.is_empty());
        assert_eq!(raw.unwrap().as_array().unwrap().len(), 2);
    }
}
