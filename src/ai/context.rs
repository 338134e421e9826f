//! Token estimation and context-window truncation.
//!
//! Token counts use a rough `chars / 4` heuristic rather than a real
//! tokenizer so the estimate stays provider-agnostic.  Two truncation
//! strategies exist: a message-level one used when the context is first
//! assembled, and an atomic-block one used mid-loop so a `tool_use` is
//! never separated from its `tool_result` (both provider dialects reject
//! an orphaned half).

use super::types::ChatMessage;

/// Hard ceiling on input tokens regardless of the model's own limit.
pub const MAX_INPUT_TOKENS: usize = 200_000;

/// Share of the context limit the assembler budgets for.
pub const CONTEXT_BUDGET_RATIO: f64 = 0.80;

const DEFAULT_CONTEXT_LIMIT: usize = 128_000;

/// Known model context limits.  Matched exactly first, then by prefix so
/// dated variants resolve.
const MODEL_CONTEXT_LIMITS: &[(&str, usize)] = &[
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-haiku-4", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("claude-3-5-haiku", 200_000),
    ("claude-3-opus", 200_000),
    ("claude-3-haiku", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-5", 128_000),
    ("o1-mini", 128_000),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
];

/// Return the context limit for a model, capped at [`MAX_INPUT_TOKENS`].
pub fn context_limit_for(model: Option<&str>) -> usize {
    let Some(model) = model else {
        return DEFAULT_CONTEXT_LIMIT.min(MAX_INPUT_TOKENS);
    };
    for (prefix, limit) in MODEL_CONTEXT_LIMITS {
        if model == *prefix || model.starts_with(prefix) {
            return (*limit).min(MAX_INPUT_TOKENS);
        }
    }
    DEFAULT_CONTEXT_LIMIT.min(MAX_INPUT_TOKENS)
}

/// The token budget for a model: 80% of its capped context limit.
pub fn context_budget_for(model: Option<&str>) -> usize {
    (context_limit_for(model) as f64 * CONTEXT_BUDGET_RATIO) as usize
}

/// Rough token estimate: chars / 4.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Estimate tokens for a single message, including tool-call argument
/// bodies and raw provider blocks.
pub fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    // Overhead for role and structure.
    let mut tokens = 4;
    if let Some(content) = &msg.content {
        tokens += estimate_tokens(content);
    }
    for tc in &msg.tool_calls {
        tokens += estimate_tokens(&tc.name);
        tokens += estimate_tokens(&tc.arguments.to_string());
    }
    if let Some(raw) = &msg.raw_blocks {
        tokens += estimate_tokens(&raw.to_string());
    }
    tokens
}

/// Truncate the oldest conversation messages to fit within a token budget.
///
/// System messages are always kept and message order is preserved.  If the
/// system messages alone exceed the budget, system messages plus the single
/// most recent conversation message are returned.
pub fn truncate_to_budget(messages: Vec<ChatMessage>, budget_tokens: usize) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let (system_msgs, conv_msgs): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(ChatMessage::is_system);

    let system_tokens: usize = system_msgs.iter().map(estimate_message_tokens).sum();
    if system_tokens >= budget_tokens {
        let mut result = system_msgs;
        if let Some(last) = conv_msgs.into_iter().next_back() {
            result.push(last);
        }
        return result;
    }
    let remaining = budget_tokens - system_tokens;

    let mut kept: Vec<ChatMessage> = Vec::new();
    let mut total = 0;
    for msg in conv_msgs.into_iter().rev() {
        let msg_tokens = estimate_message_tokens(&msg);
        if total + msg_tokens > remaining {
            break;
        }
        total += msg_tokens;
        kept.push(msg);
    }
    kept.reverse();

    let mut result = system_msgs;
    result.extend(kept);
    result
}

/// Truncate tool-loop messages to a budget without ever splitting an
/// atomic block.
///
/// An assistant message with tool calls plus the tool-result messages that
/// follow it form one block; any other message is a block of its own.
/// Oldest blocks are dropped first.  If the system messages alone exceed
/// the budget, system messages plus the single most recent block are
/// returned.
pub fn truncate_tool_loop_messages(
    messages: Vec<ChatMessage>,
    budget_tokens: usize,
) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let (system_msgs, conv_msgs): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(ChatMessage::is_system);

    // Group into atomic blocks.
    let mut blocks: Vec<Vec<ChatMessage>> = Vec::new();
    let mut iter = conv_msgs.into_iter().peekable();
    while let Some(msg) = iter.next() {
        if msg.role == super::types::Role::Assistant && !msg.tool_calls.is_empty() {
            let mut block = vec![msg];
            while iter
                .peek()
                .is_some_and(|m| m.role == super::types::Role::Tool)
            {
                // Guarded by the peek above.
                if let Some(tool_msg) = iter.next() {
                    block.push(tool_msg);
                }
            }
            blocks.push(block);
        } else {
            blocks.push(vec![msg]);
        }
    }

    let system_tokens: usize = system_msgs.iter().map(estimate_message_tokens).sum();
    if system_tokens >= budget_tokens {
        let mut result = system_msgs;
        if let Some(last) = blocks.pop() {
            result.extend(last);
        }
        return result;
    }
    let remaining = budget_tokens - system_tokens;

    let mut kept: Vec<Vec<ChatMessage>> = Vec::new();
    let mut total = 0;
    for block in blocks.into_iter().rev() {
        let block_tokens: usize = block.iter().map(estimate_message_tokens).sum();
        if total + block_tokens > remaining {
            break;
        }
        total += block_tokens;
        kept.push(block);
    }
    kept.reverse();

    let mut result = system_msgs;
    for block in kept {
        result.extend(block);
    }
    result
}
