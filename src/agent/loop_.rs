//! The agentic tool loop — the core execution engine.
//!
//! Sends messages plus tool schemas to an LLM, executes tool calls with
//! permission checks, feeds results back, and loops until the model
//! produces a final text response or a cap is reached.
//!
//! ```text
//! drain inject channel
//!       │
//!       ▼
//! truncate to token cap ─► provider.chat()
//!       │
//!       ▼ stop_reason = max_tokens?  → discard tool calls, append feedback,
//!       │                              count a consecutive error, repeat
//!       ▼ no tool calls?             → return final text (or carry raw
//!       │                              server-tool blocks and repeat)
//!       ▼ tool calls
//! permission check each call
//!   all Allow and ≥2 calls → execute concurrently
//!   otherwise             → execute sequentially (Ask prompts in order)
//! append results in original call order; 5 consecutive errors aborts
//! ```

use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::ai::context::{MAX_INPUT_TOKENS, truncate_tool_loop_messages};
use crate::ai::provider::{LLMProvider, ProviderError, tools_to_anthropic, tools_to_openai};
use crate::ai::types::{ChatMessage, Role, ToolCall, Usage};
use crate::security::policy::{PermissionDecision, check, format_action};
use crate::tools::registry::ToolRegistry;
use crate::tools::schema::validate_arguments;
use crate::tools::traits::{ExecutionContext, ToolDefinition};

/// Consecutive tool errors (or output-limit truncations) before the loop
/// gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

const TRUNCATION_FEEDBACK: &str =
    "Your previous response was cut off at max_tokens; retry with shorter \
     tool arguments or split the work into smaller steps.";

// ─── Action strings ────────────────────────────────────────────────────────

/// Build the permission action string for a tool call: the category comes
/// from a static name→category mapping and the detail is the most
/// meaningful argument for that category.
pub fn build_action_string(tool_name: &str, arguments: &Value) -> String {
    let category: &str = match tool_name {
        "create_file" | "str_replace" | "view" | "append_file" => "file",
        "bash" => "bash",
        name if name.starts_with("git_") => "git",
        name if name.starts_with("self_edit_") => "self_edit",
        "list_models" | "list_processes" => "info",
        "web_search" => "web_search",
        "claude_code" => "claude_code",
        "run_process" => {
            if arguments.get("kind").and_then(Value::as_str) == Some("background") {
                "run_background"
            } else {
                "run_concurrent"
            }
        }
        other => other,
    };

    let detail: String = match category {
        "file" => arguments
            .get("path")
            .and_then(Value::as_str)
            .map_or_else(|| arguments.to_string(), str::to_owned),
        "bash" => arguments
            .get("command")
            .and_then(Value::as_str)
            .map_or_else(|| arguments.to_string(), str::to_owned),
        "git" => {
            let op = tool_name.trim_start_matches("git_");
            format!("{op} {arguments}")
        }
        "self_edit" => {
            let sub = tool_name.trim_start_matches("self_edit_");
            let arg = |key: &str| {
                arguments
                    .get(key)
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default()
            };
            match sub {
                "system_prompt" => "system_prompt".to_owned(),
                "docs" => format!("docs {}", arg("path")),
                "permissions" => format!("permissions {}", arg("profile")),
                "model" => format!("model {}", arg("model")),
                "web_search" => format!("web_search {}", arg("enabled")),
                other => other.to_owned(),
            }
        }
        "claude_code" => {
            let task = arguments.get("task").and_then(Value::as_str).unwrap_or("");
            task.chars().take(100).collect()
        }
        "web_search" => "enabled".to_owned(),
        "run_concurrent" | "run_background" => arguments
            .get("command")
            .and_then(Value::as_str)
            .map_or_else(|| arguments.to_string(), str::to_owned),
        "info" => String::new(),
        _ => arguments.to_string(),
    };

    format_action(category, &detail)
}

// ─── Events ────────────────────────────────────────────────────────────────

/// Lifecycle events emitted during the tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolLoopEventKind {
    LlmCallStart,
    LlmCallComplete,
    ToolCallStart,
    ToolCallComplete,
    LoopComplete,
}

/// Event payload for tool-loop lifecycle callbacks.
#[derive(Debug, Clone)]
pub struct ToolLoopEvent {
    pub kind: ToolLoopEventKind,
    pub iteration: u32,
    pub tool_name: Option<String>,
    pub tool_arguments: Option<Value>,
    pub usage_delta: Option<Usage>,
    pub total_usage: Usage,
    pub tool_calls_made: u32,
    pub tools_used: Vec<String>,
    pub content_preview: Option<String>,
}

impl ToolLoopEvent {
    fn new(kind: ToolLoopEventKind, iteration: u32) -> Self {
        Self {
            kind,
            iteration,
            tool_name: None,
            tool_arguments: None,
            usage_delta: None,
            total_usage: Usage::default(),
            tool_calls_made: 0,
            tools_used: Vec::new(),
            content_preview: None,
        }
    }
}

/// Asked for ASK-gated calls: `(tool_name, arguments_json) → approved`.
pub type AskCallback = Arc<dyn Fn(String, String) -> BoxFuture<'static, bool> + Send + Sync>;
/// Receives lifecycle events; errors in the callback never affect the loop.
pub type EventCallback = Arc<dyn Fn(ToolLoopEvent) -> BoxFuture<'static, ()> + Send + Sync>;

async fn fire_event(on_event: Option<&EventCallback>, event: ToolLoopEvent) {
    if let Some(cb) = on_event {
        cb(event).await;
    }
}

// ─── Options and result ────────────────────────────────────────────────────

/// Optional knobs for [`run_tool_loop`].
pub struct ToolLoopOptions {
    pub max_iterations: u32,
    pub ask_callback: Option<AskCallback>,
    /// Per-branch inject channel, drained at each iteration boundary.
    pub inject: Option<mpsc::UnboundedReceiver<ChatMessage>>,
    pub on_event: Option<EventCallback>,
    pub web_search_enabled: bool,
}

impl Default for ToolLoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            ask_callback: None,
            inject: None,
            on_event: None,
            web_search_enabled: false,
        }
    }
}

/// Result of a complete tool loop run.
#[derive(Debug)]
pub struct ToolLoopResult {
    pub content: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub total_usage: Usage,
    pub iterations: u32,
    pub tool_calls_made: u32,
}

// ─── Result classification ─────────────────────────────────────────────────

fn error_json(message: &str) -> String {
    json!({"error": message}).to_string()
}

/// A tool result is an error when it is a JSON object with a top-level
/// `error` key.  Non-JSON results are successes.
fn is_error_result(result: &str) -> bool {
    serde_json::from_str::<Value>(result)
        .ok()
        .and_then(|v| v.get("error").cloned())
        .is_some()
}

/// Tool results may carry a `cost_usd` field (e.g. a delegated coding
/// session reporting its spend); non-JSON results contribute zero.
fn extract_cost(result: &str) -> f64 {
    serde_json::from_str::<Value>(result)
        .ok()
        .and_then(|v| v.get("cost_usd").and_then(Value::as_f64))
        .unwrap_or(0.0)
}

// ─── Tool execution ────────────────────────────────────────────────────────

/// Validate arguments, inject context values, run the handler, and render
/// the result as the tool-message content string.
async fn execute_cleared(
    tool: &ToolDefinition,
    tc: &ToolCall,
    ctx: &ExecutionContext,
) -> String {
    if let Err(message) = validate_arguments(tool, &tc.arguments) {
        return error_json(&message);
    }

    let mut args = if tc.arguments.is_object() {
        tc.arguments.clone()
    } else {
        json!({})
    };
    if let Value::Object(map) = &mut args {
        for name in &tool.context_params {
            // The model's value wins over the injected context value.
            if !map.contains_key(*name) {
                if let Some(value) = ctx.context_value(name) {
                    map.insert((*name).to_owned(), value);
                }
            }
        }
    }

    match (tool.handler)(args.clone(), ctx.clone()).await {
        Ok(Value::String(text)) => text,
        Ok(value) => value.to_string(),
        Err(e) => {
            let expected = tool
                .parameters
                .get("properties")
                .cloned()
                .unwrap_or_else(|| json!({}));
            error_json(&format!(
                "{}: {}\nProvided arguments: {}\nExpected parameters: {}",
                e.kind(),
                e,
                tc.arguments,
                expected
            ))
        }
    }
}

/// Handle one tool call end-to-end: lookup, permission gate, execution.
async fn handle_tool_call(
    tc: &ToolCall,
    tools: &ToolRegistry,
    ctx: &ExecutionContext,
    ask_callback: Option<&AskCallback>,
) -> String {
    let Some(tool) = tools.get(&tc.name) else {
        return error_json(&format!("Unknown tool: {}", tc.name));
    };

    let action = build_action_string(&tc.name, &tc.arguments);
    match check(&action, &ctx.profile) {
        PermissionDecision::Deny => {
            info!(tool = %tc.name, %action, "permission denied");
            error_json(&format!("Permission denied: {action}"))
        }
        PermissionDecision::Ask => match ask_callback {
            None => error_json(&format!(
                "Permission requires approval (no callback): {action}"
            )),
            Some(ask) => {
                let approved = ask(tc.name.clone(), tc.arguments.to_string()).await;
                if approved {
                    execute_cleared(tool, tc, ctx).await
                } else {
                    info!(tool = %tc.name, %action, "user declined");
                    error_json(&format!("User declined: {action}"))
                }
            }
        },
        PermissionDecision::Allow => execute_cleared(tool, tc, ctx).await,
    }
}

// ─── The loop ──────────────────────────────────────────────────────────────

/// Run the agentic tool loop to completion.
///
/// Provider transport failures propagate; everything that happens inside a
/// tool handler is recovered into a structured error result the model can
/// react to.
#[tracing::instrument(
    name = "agent.tool_loop",
    skip_all,
    fields(model = %model, max_iterations = opts.max_iterations)
)]
pub async fn run_tool_loop(
    provider: &dyn LLMProvider,
    mut messages: Vec<ChatMessage>,
    tools: &ToolRegistry,
    ctx: &ExecutionContext,
    system_prompt: &str,
    model: &str,
    mut opts: ToolLoopOptions,
) -> Result<ToolLoopResult, ProviderError> {
    let tool_infos = tools.list();
    let is_openai = provider.provider_name() == "openai";
    let mut tool_schemas: Option<Vec<Value>> = if tool_infos.is_empty() {
        None
    } else if is_openai {
        Some(tools_to_openai(&tool_infos))
    } else {
        Some(tools_to_anthropic(&tool_infos))
    };

    // One-time permission gate for the provider-internal web search tool.
    let mut web_search = opts.web_search_enabled && !is_openai;
    if web_search {
        let action = format_action("web_search", "enabled");
        match check(&action, &ctx.profile) {
            PermissionDecision::Deny => {
                info!("web search denied by permission profile");
                web_search = false;
            }
            PermissionDecision::Ask => match &opts.ask_callback {
                None => {
                    info!("web search needs approval with no callback; disabling");
                    web_search = false;
                }
                Some(ask) => {
                    if !ask("web_search".to_owned(), r#"{"enabled": true}"#.to_owned()).await {
                        info!("user denied web search");
                        web_search = false;
                    }
                }
            },
            PermissionDecision::Allow => {}
        }
        if web_search {
            tool_schemas.get_or_insert_with(Vec::new).push(json!({
                "type": "web_search_20250305",
                "name": "web_search",
                "max_uses": 5,
            }));
        }
    }

    if !system_prompt.is_empty()
        && messages.first().is_none_or(|m| m.role != Role::System)
    {
        messages.insert(0, ChatMessage::system(system_prompt));
    }

    let mut total_usage = Usage::default();
    let mut total_tool_calls: u32 = 0;
    let mut tools_used: Vec<String> = Vec::new();
    let mut consecutive_errors: u32 = 0;
    let on_event = opts.on_event.clone();

    for iteration in 1..=opts.max_iterations {
        // Injected messages merge only at iteration boundaries, never
        // during a provider call.
        if let Some(rx) = opts.inject.as_mut() {
            while let Ok(injected) = rx.try_recv() {
                messages.push(injected);
            }
        }

        let mut event = ToolLoopEvent::new(ToolLoopEventKind::LlmCallStart, iteration);
        event.total_usage = total_usage;
        event.tool_calls_made = total_tool_calls;
        event.tools_used = tools_used.clone();
        fire_event(on_event.as_ref(), event).await;

        messages = truncate_tool_loop_messages(messages, MAX_INPUT_TOKENS);

        let response = provider
            .chat(&messages, tool_schemas.as_deref(), Some(model))
            .await?;
        total_usage += response.usage;

        let mut event = ToolLoopEvent::new(ToolLoopEventKind::LlmCallComplete, iteration);
        event.usage_delta = Some(response.usage);
        event.total_usage = total_usage;
        event.tool_calls_made = total_tool_calls;
        event.tools_used = tools_used.clone();
        fire_event(on_event.as_ref(), event).await;

        // Output-budget truncation: discard any tool calls (their argument
        // bodies may be cut mid-JSON), feed back a correction, and count it
        // against the circuit breaker.
        if response.is_truncated() {
            warn!(
                iteration,
                discarded_tool_calls = response.tool_calls.len(),
                "response truncated at max_tokens"
            );
            messages.push(ChatMessage::user(TRUNCATION_FEEDBACK));
            consecutive_errors += 1;
            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                fire_loop_complete(on_event.as_ref(), iteration, total_usage, total_tool_calls, &tools_used, None).await;
                return Ok(ToolLoopResult {
                    content: Some(breaker_message("repeated output-limit truncation")),
                    messages,
                    total_usage,
                    iterations: iteration,
                    tool_calls_made: total_tool_calls,
                });
            }
            continue;
        }

        if response.tool_calls.is_empty() {
            if let Some(raw) = response.raw_blocks {
                // Server-executed tool results (e.g. web search): carry the
                // raw blocks forward so the model can process them.
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: response.content.clone(),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    raw_blocks: Some(raw),
                });
                continue;
            }

            let preview = response
                .content
                .as_deref()
                .map(|c| c.chars().take(200).collect::<String>());
            fire_loop_complete(on_event.as_ref(), iteration, total_usage, total_tool_calls, &tools_used, preview).await;
            return Ok(ToolLoopResult {
                content: response.content,
                messages,
                total_usage,
                iterations: iteration,
                tool_calls_made: total_tool_calls,
            });
        }

        messages.push(ChatMessage {
            role: Role::Assistant,
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            tool_call_id: None,
            raw_blocks: response.raw_blocks.clone(),
        });

        // Parallel dispatch only when every call is already cleared —
        // nothing to prompt for, nothing unknown.
        let parallel = response.tool_calls.len() >= 2
            && response.tool_calls.iter().all(|tc| {
                tools.get(&tc.name).is_some()
                    && check(&build_action_string(&tc.name, &tc.arguments), &ctx.profile)
                        == PermissionDecision::Allow
            });

        let results: Vec<String> = if parallel {
            for tc in &response.tool_calls {
                let mut event = ToolLoopEvent::new(ToolLoopEventKind::ToolCallStart, iteration);
                event.tool_name = Some(tc.name.clone());
                event.tool_arguments = Some(tc.arguments.clone());
                event.total_usage = total_usage;
                event.tool_calls_made = total_tool_calls;
                event.tools_used = tools_used.clone();
                fire_event(on_event.as_ref(), event).await;
            }
            // Concurrent execution; results come back position-wise so the
            // transcript order matches the call order.
            join_all(response.tool_calls.iter().map(|tc| async move {
                match tools.get(&tc.name) {
                    Some(tool) => execute_cleared(tool, tc, ctx).await,
                    None => error_json(&format!("Unknown tool: {}", tc.name)),
                }
            }))
            .await
        } else {
            let mut results = Vec::with_capacity(response.tool_calls.len());
            for tc in &response.tool_calls {
                let mut event = ToolLoopEvent::new(ToolLoopEventKind::ToolCallStart, iteration);
                event.tool_name = Some(tc.name.clone());
                event.tool_arguments = Some(tc.arguments.clone());
                event.total_usage = total_usage;
                event.tool_calls_made = total_tool_calls;
                event.tools_used = tools_used.clone();
                fire_event(on_event.as_ref(), event).await;

                results
                    .push(handle_tool_call(tc, tools, ctx, opts.ask_callback.as_ref()).await);
            }
            results
        };

        for (tc, result) in response.tool_calls.iter().zip(results.iter()) {
            messages.push(ChatMessage::tool_result(tc.id.clone(), result.clone()));
            total_tool_calls += 1;
            if !tools_used.contains(&tc.name) {
                tools_used.push(tc.name.clone());
            }
            if is_error_result(result) {
                consecutive_errors += 1;
            } else {
                consecutive_errors = 0;
            }
            total_usage.cost_usd += extract_cost(result);

            let mut event = ToolLoopEvent::new(ToolLoopEventKind::ToolCallComplete, iteration);
            event.tool_name = Some(tc.name.clone());
            event.total_usage = total_usage;
            event.tool_calls_made = total_tool_calls;
            event.tools_used = tools_used.clone();
            fire_event(on_event.as_ref(), event).await;
        }

        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            warn!(iteration, "too many consecutive tool errors; stopping");
            fire_loop_complete(on_event.as_ref(), iteration, total_usage, total_tool_calls, &tools_used, None).await;
            return Ok(ToolLoopResult {
                content: Some(breaker_message("repeated tool errors")),
                messages,
                total_usage,
                iterations: iteration,
                tool_calls_made: total_tool_calls,
            });
        }
    }

    fire_loop_complete(
        on_event.as_ref(),
        opts.max_iterations,
        total_usage,
        total_tool_calls,
        &tools_used,
        None,
    )
    .await;
    Ok(ToolLoopResult {
        content: Some(format!(
            "Stopped after max iterations ({}). The task may be incomplete.",
            opts.max_iterations
        )),
        messages,
        total_usage,
        iterations: opts.max_iterations,
        tool_calls_made: total_tool_calls,
    })
}

fn breaker_message(cause: &str) -> String {
    format!(
        "Stopped after {MAX_CONSECUTIVE_ERRORS} consecutive errors ({cause}). \
         The task may be incomplete."
    )
}

async fn fire_loop_complete(
    on_event: Option<&EventCallback>,
    iteration: u32,
    total_usage: Usage,
    tool_calls_made: u32,
    tools_used: &[String],
    content_preview: Option<String>,
) {
    let mut event = ToolLoopEvent::new(ToolLoopEventKind::LoopComplete, iteration);
    event.total_usage = total_usage;
    event.tool_calls_made = tool_calls_made;
    event.tools_used = tools_used.to_vec();
    event.content_preview = content_preview;
    fire_event(on_event, event).await;
}
