//! Translate natural-language instructions into structured process
//! callbacks.
//!
//! The LLM-backed builder is a thin adapter over any provider; the parser
//! from its JSON output into [`ProcessCallback`]s is the part the runtime
//! depends on.  Parse failures and empty instructions fall back to a
//! single `on_exit(any) → notify_channel` callback.

use serde_json::Value;
use tracing::warn;

use crate::ai::provider::LLMProvider;
use crate::ai::types::ChatMessage;

use super::models::{CallbackAction, ExitFilter, HookTrigger, ProcessCallback};

const BUILDER_SYSTEM_PROMPT: &str = r#"You are a callback configuration assistant. Given natural language instructions about what should happen with a running process, produce a JSON array of callback objects.

## Schema

Each callback object has these fields:

{
  "trigger": {
    "type": "on_exit" | "on_output_match" | "on_timeout",
    "exit_filter": "any" | "success" | "failure",  // only for on_exit
    "pattern": "regex",                             // only for on_output_match
    "timeout_seconds": number                       // only for on_timeout
  },
  "action": "stop_process" | "stop_branch" | "inject_context" | "spawn_branch" | "notify_channel",
  "context_message": "string passed to the action handler as context",
  "output_delay_seconds": number,  // wait before firing on_output_match (default 2.0)
  "max_fires": integer,            // how many times this callback can fire (default 1)
  "min_message_interval": number   // rate-limit seconds between notify_channel fires (default 180)
}

## Actions

- stop_process: Kill the monitored process.
- stop_branch: Kill the execution branch that started this process.
- inject_context: Send a message into the current branch's conversation.
- spawn_branch: Start a NEW autonomous branch with context_message as its instructions. This is the primary way to chain autonomous reactions.
- notify_channel: Post a notification to the chat channel (informational only).

## Guidelines

- The context_message for spawn_branch must be a clear instruction for the new branch.
- max_fires: 0 means unlimited. For on_output_match default to 0; for on_exit and on_timeout default to 1.
- Use inject_context when the CURRENT branch should react (it must still be running); use spawn_branch for autonomous handling.

Respond ONLY with a JSON array. No explanation."#;

/// The fallback used when instructions are empty or parsing fails.
pub fn default_callback() -> ProcessCallback {
    let mut cb = ProcessCallback::new(
        HookTrigger::OnExit {
            exit_filter: ExitFilter::Any,
        },
        CallbackAction::NotifyChannel,
    );
    cb.context_message = "Process completed".to_owned();
    cb
}

/// Translate instructions into callbacks using a cheap LLM call.
pub async fn build_callbacks_from_instructions(
    provider: &dyn LLMProvider,
    instructions: &str,
    command: &str,
    default_output_delay: f64,
) -> Vec<ProcessCallback> {
    if instructions.trim().is_empty() {
        return vec![default_callback()];
    }

    let messages = vec![
        ChatMessage::system(BUILDER_SYSTEM_PROMPT),
        ChatMessage::user(format!("Command: `{command}`\nInstructions: {instructions}")),
    ];

    let output = match provider.chat(&messages, None, None).await {
        Ok(response) => response.content.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "callback builder call failed");
            return vec![default_callback()];
        }
    };

    let callbacks = parse_callbacks(&output, default_output_delay);
    if callbacks.is_empty() {
        warn!("callback builder returned nothing parseable");
        return vec![default_callback()];
    }
    callbacks
}

/// Parse a JSON document (optionally fenced in markdown) into callbacks.
/// Invalid entries are skipped; an unparseable document yields an empty
/// list.
pub fn parse_callbacks(raw: &str, default_output_delay: f64) -> Vec<ProcessCallback> {
    let text = strip_code_fences(raw.trim());

    let data: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "callback document is not valid JSON");
            return Vec::new();
        }
    };
    let items = match data {
        Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match parse_single(&item, default_output_delay) {
            Ok(cb) => Some(cb),
            Err(reason) => {
                warn!(reason, "skipping invalid callback entry");
                None
            }
        })
        .collect()
}

fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the fence line (possibly "```json") and the closing fence.
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_single(item: &Value, default_output_delay: f64) -> Result<ProcessCallback, &'static str> {
    let trigger_value = item.get("trigger").ok_or("missing trigger")?;
    let trigger: HookTrigger =
        serde_json::from_value(trigger_value.clone()).map_err(|_| "malformed trigger")?;

    let action_value = item
        .get("action")
        .cloned()
        .unwrap_or(Value::String("spawn_branch".to_owned()));
    let action: CallbackAction =
        serde_json::from_value(action_value).map_err(|_| "unknown action")?;

    let is_output_match = matches!(trigger, HookTrigger::OnOutputMatch { .. });

    let output_delay_seconds = item
        .get("output_delay_seconds")
        .and_then(Value::as_f64)
        .unwrap_or(if is_output_match {
            default_output_delay
        } else {
            0.0
        });

    let max_fires = item
        .get("max_fires")
        .and_then(Value::as_u64)
        .map_or_else(|| u32::from(!is_output_match), |n| n as u32);

    let mut cb = ProcessCallback::new(trigger, action);
    cb.context_message = item
        .get("context_message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    cb.output_delay_seconds = output_delay_seconds;
    cb.max_fires = max_fires;
    if let Some(interval) = item.get("min_message_interval").and_then(Value::as_f64) {
        cb.min_message_interval = interval;
    }
    Ok(cb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_parses_to_nothing() {
        assert!(parse_callbacks("not json at all", 2.0).is_empty());
        assert!(parse_callbacks("[]", 2.0).is_empty());
    }

    #[test]
    fn single_object_is_accepted_like_an_array() {
        let cbs = parse_callbacks(
            r#"{"trigger": {"type": "on_exit"}, "action": "notify_channel", "context_message": "done"}"#,
            2.0,
        );
        assert_eq!(cbs.len(), 1);
        assert_eq!(cbs[0].action, CallbackAction::NotifyChannel);
        assert_eq!(cbs[0].context_message, "done");
        assert_eq!(cbs[0].max_fires, 1);
        assert_eq!(cbs[0].output_delay_seconds, 0.0);
    }

    #[test]
    fn output_match_defaults_unlimited_fires_and_delay() {
        let cbs = parse_callbacks(
            r#"[{"trigger": {"type": "on_output_match", "pattern": "ERROR"},
                 "action": "notify_channel"}]"#,
            2.0,
        );
        assert_eq!(cbs.len(), 1);
        assert_eq!(cbs[0].max_fires, 0);
        assert!((cbs[0].output_delay_seconds - 2.0).abs() < f64::EPSILON);
        assert!((cbs[0].min_message_interval - 180.0).abs() < f64::EPSILON);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let cbs = parse_callbacks(
            r#"[{"trigger": {"type": "on_output_match", "pattern": "ready"},
                 "action": "inject_context",
                 "context_message": "Server is ready.",
                 "output_delay_seconds": 1.0,
                 "max_fires": 2,
                 "min_message_interval": 60}]"#,
            2.0,
        );
        assert_eq!(cbs[0].max_fires, 2);
        assert!((cbs[0].output_delay_seconds - 1.0).abs() < f64::EPSILON);
        assert!((cbs[0].min_message_interval - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn timeout_triggers_parse() {
        let cbs = parse_callbacks(
            r#"[{"trigger": {"type": "on_timeout", "timeout_seconds": 600},
                 "action": "stop_process",
                 "context_message": "Process timed out"}]"#,
            2.0,
        );
        assert_eq!(
            cbs[0].trigger,
            HookTrigger::OnTimeout {
                timeout_seconds: 600.0
            }
        );
        assert_eq!(cbs[0].action, CallbackAction::StopProcess);
        assert_eq!(cbs[0].max_fires, 1);
    }

    #[test]
    fn invalid_entries_are_skipped_not_fatal() {
        let cbs = parse_callbacks(
            r#"[{"trigger": {"type": "bogus"}, "action": "notify_channel"},
                {"trigger": {"type": "on_exit", "exit_filter": "failure"},
                 "action": "spawn_branch",
                 "context_message": "Diagnose and fix."}]"#,
            2.0,
        );
        assert_eq!(cbs.len(), 1);
        assert_eq!(cbs[0].action, CallbackAction::SpawnBranch);
        assert_eq!(
            cbs[0].trigger,
            HookTrigger::OnExit {
                exit_filter: ExitFilter::Failure
            }
        );
    }

    #[test]
    fn markdown_fences_are_stripped() {
        let raw = "```json\n[{\"trigger\": {\"type\": \"on_exit\"}, \"action\": \"notify_channel\"}]\n```";
        let cbs = parse_callbacks(raw, 2.0);
        assert_eq!(cbs.len(), 1);
    }

    #[test]
    fn default_callback_shape() {
        let cb = default_callback();
        assert_eq!(cb.action, CallbackAction::NotifyChannel);
        assert_eq!(cb.context_message, "Process completed");
        assert_eq!(cb.max_fires, 1);
        assert!(matches!(
            cb.trigger,
            HookTrigger::OnExit {
                exit_filter: ExitFilter::Any
            }
        ));
    }
}
