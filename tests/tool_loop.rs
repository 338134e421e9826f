//! End-to-end tool loop scenarios against a scripted provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use chorus::agent::loop_::{ToolLoopOptions, run_tool_loop};
use chorus::ai::provider::{LLMProvider, ProviderError};
use chorus::ai::types::{ChatMessage, LLMResponse, Role, ToolCall, Usage};
use chorus::security::policy::preset;
use chorus::tools::registry::ToolRegistry;
use chorus::tools::traits::{ExecutionContext, ToolDefinition, ToolHandler};

// ─── Scripted provider ─────────────────────────────────────────────────────

struct ScriptedProvider {
    name: &'static str,
    responses: Mutex<VecDeque<LLMResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<LLMResponse>) -> Self {
        Self {
            name: "anthropic",
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request(&self, index: usize) -> Vec<ChatMessage> {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        self.name
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[Value]>,
        _model: Option<&str>,
    ) -> Result<LLMResponse, ProviderError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_response("No more responses")))
    }
}

fn text_response(text: &str) -> LLMResponse {
    LLMResponse {
        content: Some(text.to_owned()),
        tool_calls: vec![],
        stop_reason: "end_turn".to_owned(),
        usage: Usage::new(10, 5),
        model: "scripted".to_owned(),
        raw_blocks: None,
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_owned(),
        name: name.to_owned(),
        arguments,
    }
}

fn tool_response(tool_calls: Vec<ToolCall>) -> LLMResponse {
    LLMResponse {
        content: None,
        tool_calls,
        stop_reason: "tool_use".to_owned(),
        usage: Usage::new(10, 5),
        model: "scripted".to_owned(),
        raw_blocks: None,
    }
}

// ─── Recording tools ───────────────────────────────────────────────────────

type CallLog = Arc<Mutex<Vec<Value>>>;

fn recording_tool(name: &str, log: CallLog, delay: Duration, result: Value) -> ToolDefinition {
    let handler: ToolHandler = Arc::new(move |args, _ctx| {
        let log = Arc::clone(&log);
        let result = result.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            log.lock().unwrap().push(args);
            Ok(result)
        })
    });
    ToolDefinition::new(
        name,
        "test tool",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path"},
                "content": {"type": "string", "description": "File content"},
            },
            "required": ["path"],
        }),
        vec!["workspace"],
        handler,
    )
}

fn open_ctx() -> ExecutionContext {
    ExecutionContext::new("/tmp/ws", preset("open").unwrap(), "tester")
}

// ─── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_text_turn() {
    let provider = ScriptedProvider::new(vec![text_response("Hello!")]);
    let tools = ToolRegistry::new();
    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("Hi")],
        &tools,
        &open_ctx(),
        "You are a helper.",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.content.as_deref(), Some("Hello!"));
    assert_eq!(result.iterations, 1);
    assert_eq!(result.tool_calls_made, 0);
    assert_eq!(result.total_usage.input_tokens, 10);
    assert_eq!(result.total_usage.output_tokens, 5);
}

#[tokio::test]
async fn tool_round_trip_injects_workspace_and_records_result() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![call(
            "call_1",
            "create_file",
            json!({"path": "test.txt", "content": "hello"}),
        )]),
        text_response("Done."),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool(
        "create_file",
        Arc::clone(&log),
        Duration::ZERO,
        json!({"ok": true}),
    ));

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("Create file")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.content.as_deref(), Some("Done."));
    assert_eq!(result.tool_calls_made, 1);

    // Handler invoked exactly once, with the workspace injected by name.
    let calls = log.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["path"], "test.txt");
    assert_eq!(calls[0]["workspace"], "/tmp/ws");

    // A tool-role message with the result sits between the two assistant
    // turns in the transcript.
    let tool_idx = result
        .messages
        .iter()
        .position(|m| m.role == Role::Tool)
        .unwrap();
    assert!(result.messages[tool_idx].content.as_deref().unwrap().contains("ok"));
    assert_eq!(
        result.messages[tool_idx].tool_call_id.as_deref(),
        Some("call_1")
    );
    assert!(!result.messages[tool_idx - 1].tool_calls.is_empty());
}

#[tokio::test]
async fn parallel_dispatch_preserves_order_and_overlaps() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![
            call("call_a", "slow", json!({"path": "x"})),
            call("call_b", "fast", json!({"path": "y"})),
        ]),
        text_response("both done"),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool(
        "slow",
        Arc::clone(&log),
        Duration::from_millis(200),
        json!("slow-result"),
    ));
    tools.register(recording_tool(
        "fast",
        Arc::clone(&log),
        Duration::from_millis(10),
        json!("fast-result"),
    ));

    let start = Instant::now();
    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("run both")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();
    let elapsed = start.elapsed();

    // Wall time ≈ max(t_slow, t_fast), not the sum.
    assert!(
        elapsed < Duration::from_millis(360),
        "tools did not overlap: {elapsed:?}"
    );

    // Results appear in original call order regardless of completion order.
    let tool_messages: Vec<&ChatMessage> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tool_messages[0].content.as_deref(), Some("slow-result"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_b"));
    assert_eq!(tool_messages[1].content.as_deref(), Some("fast-result"));
    assert_eq!(result.tool_calls_made, 2);
}

#[tokio::test]
async fn max_tokens_truncation_discards_tool_calls() {
    let mut truncated = tool_response(vec![call(
        "call_1",
        "create_file",
        json!({"path": "fib.py"}),
    )]);
    truncated.stop_reason = "max_tokens".to_owned();

    let provider = ScriptedProvider::new(vec![truncated, text_response("recovered")]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool(
        "create_file",
        Arc::clone(&log),
        Duration::ZERO,
        json!({"ok": true}),
    ));

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("write fib")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    // Handler never invoked; synthetic feedback appended; loop continued.
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(result.content.as_deref(), Some("recovered"));
    assert_eq!(result.tool_calls_made, 0);
    let feedback = provider.request(1);
    assert!(
        feedback.iter().any(|m| m.role == Role::User
            && m.content.as_deref().unwrap_or("").contains("cut off at max_tokens")),
        "expected truncation feedback in the second request"
    );
}

#[tokio::test]
async fn unknown_tool_yields_one_error_result_without_handler() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![call("call_1", "frobnicate", json!({}))]),
        text_response("sorry"),
    ]);
    let tools = ToolRegistry::new();

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    let tool_messages: Vec<&ChatMessage> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    let body: Value =
        serde_json::from_str(tool_messages[0].content.as_deref().unwrap()).unwrap();
    assert!(body["error"].as_str().unwrap().contains("Unknown tool"));
}

#[tokio::test]
async fn missing_required_argument_names_the_field() {
    let provider = ScriptedProvider::new(vec![
        // `path` is required by the schema but absent.
        tool_response(vec![call("call_1", "create_file", json!({"content": "x"}))]),
        text_response("noted"),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool(
        "create_file",
        Arc::clone(&log),
        Duration::ZERO,
        json!({"ok": true}),
    ));

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert!(log.lock().unwrap().is_empty(), "handler must not run");
    let tool_msg = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    let body: Value = serde_json::from_str(tool_msg.content.as_deref().unwrap()).unwrap();
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("'path'"));
    assert!(error.contains("string"));
    assert!(error.contains("File path"));
}

#[tokio::test]
async fn five_consecutive_errors_trip_the_breaker() {
    let responses: Vec<LLMResponse> = (0..8)
        .map(|i| tool_response(vec![call(&format!("call_{i}"), "nope", json!({}))]))
        .collect();
    let provider = ScriptedProvider::new(responses);
    let tools = ToolRegistry::new();

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.iterations, 5);
    assert!(result.content.as_deref().unwrap().contains("consecutive errors"));
    assert!(result.content.as_deref().unwrap().contains("repeated tool errors"));
}

#[tokio::test]
async fn denied_tool_becomes_error_result() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![call("call_1", "bash", json!({"command": "ls"}))]),
        text_response("understood"),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool("bash", Arc::clone(&log), Duration::ZERO, json!("out")));

    // Locked preset denies bash outright.
    let ctx = ExecutionContext::new("/tmp/ws", preset("locked").unwrap(), "tester");
    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &ctx,
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert!(log.lock().unwrap().is_empty());
    let tool_msg = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content.as_deref().unwrap().contains("Permission denied"));
}

#[tokio::test]
async fn ask_gate_consults_callback_and_respects_refusal() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![call("call_1", "bash", json!({"command": "pip install x"}))]),
        text_response("fine"),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool("bash", Arc::clone(&log), Duration::ZERO, json!("out")));

    let asked: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let asked_clone = Arc::clone(&asked);
    let ask: chorus::agent::loop_::AskCallback = Arc::new(move |name: String, _args: String| {
        asked_clone.lock().unwrap().push(name);
        Box::pin(async { false })
    });

    // Standard preset asks for bash.
    let ctx = ExecutionContext::new("/tmp/ws", preset("standard").unwrap(), "tester");
    let options = ToolLoopOptions {
        ask_callback: Some(ask),
        ..Default::default()
    };
    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &ctx,
        "system",
        "scripted",
        options,
    )
    .await
    .unwrap();

    assert_eq!(asked.lock().unwrap().as_slice(), ["bash"]);
    assert!(log.lock().unwrap().is_empty(), "refused call must not run");
    let tool_msg = result
        .messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .unwrap();
    assert!(tool_msg.content.as_deref().unwrap().contains("User declined"));
}

#[tokio::test]
async fn injected_messages_are_drained_at_the_iteration_boundary() {
    let provider = ScriptedProvider::new(vec![text_response("hi")]);
    let tools = ToolRegistry::new();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tx.send(ChatMessage::user("injected note")).unwrap();

    let options = ToolLoopOptions {
        inject: Some(rx),
        ..Default::default()
    };
    run_tool_loop(
        &provider,
        vec![ChatMessage::user("original")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        options,
    )
    .await
    .unwrap();

    // The injected message was part of the very first provider request.
    let first = provider.request(0);
    assert!(
        first
            .iter()
            .any(|m| m.content.as_deref() == Some("injected note"))
    );
}

#[tokio::test]
async fn max_iterations_returns_incomplete_notice() {
    let responses: Vec<LLMResponse> = (0..5)
        .map(|i| tool_response(vec![call(&format!("c{i}"), "echo", json!({"path": "x"}))]))
        .collect();
    let provider = ScriptedProvider::new(responses);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool("echo", Arc::clone(&log), Duration::ZERO, json!("ok")));

    let options = ToolLoopOptions {
        max_iterations: 3,
        ..Default::default()
    };
    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("loop forever")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        options,
    )
    .await
    .unwrap();

    assert_eq!(result.iterations, 3);
    assert!(result.content.as_deref().unwrap().contains("max iterations"));
    assert_eq!(result.tool_calls_made, 3);
}

#[tokio::test]
async fn raw_blocks_are_carried_into_the_next_turn() {
    let raw = json!([{"type": "server_tool_use", "id": "s1", "name": "web_search"}]);
    let server_turn = LLMResponse {
        content: Some("searching".to_owned()),
        tool_calls: vec![],
        stop_reason: "end_turn".to_owned(),
        usage: Usage::new(5, 2),
        model: "scripted".to_owned(),
        raw_blocks: Some(raw.clone()),
    };
    let provider = ScriptedProvider::new(vec![server_turn, text_response("found it")]);
    let tools = ToolRegistry::new();

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("search the web")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(result.content.as_deref(), Some("found it"));
    assert_eq!(result.iterations, 2);
    // The second request carries the raw blocks verbatim.
    let second = provider.request(1);
    assert!(second.iter().any(|m| m.raw_blocks == Some(raw.clone())));
}

#[tokio::test]
async fn tool_results_accumulate_cost() {
    let provider = ScriptedProvider::new(vec![
        tool_response(vec![call("c1", "worker", json!({"path": "x"}))]),
        text_response("done"),
    ]);
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(recording_tool(
        "worker",
        Arc::clone(&log),
        Duration::ZERO,
        json!({"ok": true, "cost_usd": 0.42}),
    ));

    let result = run_tool_loop(
        &provider,
        vec![ChatMessage::user("go")],
        &tools,
        &open_ctx(),
        "system",
        "scripted",
        ToolLoopOptions::default(),
    )
    .await
    .unwrap();

    assert!((result.total_usage.cost_usd - 0.42).abs() < f64::EPSILON);
}
