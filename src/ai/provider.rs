//! The [`LLMProvider`] trait and tool-schema translation helpers.

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::tools::traits::ToolInfo;

use super::types::{ChatMessage, LLMResponse};

/// Errors surfaced by provider adapters.  Transport and API failures are
/// never swallowed; they propagate to the branch runner.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("malformed provider response: {0}")]
    Decode(String),
}

/// Interface all LLM providers implement.
///
/// The only network behaviors the runtime relies on are synchronous
/// request/response, per-response token usage, and (optionally) server-side
/// tool-execution content blocks echoed back verbatim.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stable provider identifier (`"anthropic"`, `"openai"`).
    fn provider_name(&self) -> &str;

    /// Send a conversation and optional tool schemas, returning the
    /// normalized response.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        model: Option<&str>,
    ) -> Result<LLMResponse, ProviderError>;
}

// ─── Tool schema translation ───────────────────────────────────────────────

/// Convert tool definitions to Anthropic's tool schema format.
pub fn tools_to_anthropic(tools: &[ToolInfo]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

/// Convert tool definitions to OpenAI's function-calling format.
pub fn tools_to_openai(tools: &[ToolInfo]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tool() -> ToolInfo {
        ToolInfo {
            name: "create_file".to_owned(),
            description: "Create a file".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        }
    }

    #[test]
    fn anthropic_schema_shape() {
        let out = tools_to_anthropic(&[sample_tool()]);
        assert_eq!(out[0]["name"], "create_file");
        assert!(out[0]["input_schema"]["properties"]["path"].is_object());
    }

    #[test]
    fn openai_schema_shape() {
        let out = tools_to_openai(&[sample_tool()]);
        assert_eq!(out[0]["type"], "function");
        assert_eq!(out[0]["function"]["name"], "create_file");
        assert!(out[0]["function"]["parameters"]["required"].is_array());
    }
}
