//! Tools that drive the process supervisor: spawning tracked processes
//! with hook callbacks, listing, stopping, and attaching callbacks to a
//! running process.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::process::callback_builder::{default_callback, parse_callbacks};
use crate::process::manager::SpawnRequest;
use crate::process::models::{ProcessCallback, ProcessKind};

use super::traits::{ExecutionContext, ToolDefinition, ToolError, ToolHandler};
use super::{optional_str, optional_u64, require_str};

const DEFAULT_OUTPUT_DELAY: f64 = 2.0;

fn callbacks_from_args(args: &Value) -> Vec<ProcessCallback> {
    match args.get("callbacks") {
        Some(value) => {
            let raw = value.to_string();
            parse_callbacks(&raw, DEFAULT_OUTPUT_DELAY)
        }
        None => vec![default_callback()],
    }
}

fn run_process(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let pm = ctx
            .process_manager
            .clone()
            .ok_or_else(|| ToolError::Unavailable("process supervisor not configured".into()))?;
        let command = require_str(&args, "command")?.to_owned();
        let kind = match optional_str(&args, "kind") {
            Some("background") => ProcessKind::Background,
            _ => ProcessKind::Concurrent,
        };
        let callbacks = callbacks_from_args(&args);
        let callback_count = callbacks.len();

        let mut request = SpawnRequest::new(&command, &ctx.workspace, &ctx.agent_name, kind);
        request.callbacks = callbacks;
        request.context = optional_str(&args, "context").unwrap_or_default().to_owned();
        request.model_for_hooks = optional_str(&args, "model_for_hooks").map(str::to_owned);
        request.spawned_by_branch = ctx.branch_id;

        let tracked = pm
            .spawn(request)
            .await
            .map_err(|e| ToolError::Other(e.to_string()))?;

        Ok(json!({
            "pid": tracked.pid,
            "status": "running",
            "command": command,
            "kind": optional_str(&args, "kind").unwrap_or("concurrent"),
            "callbacks": callback_count,
            "stdout_log": tracked.stdout_log,
            "stderr_log": tracked.stderr_log,
        }))
    })
}

fn list_processes(
    args: Value,
    ctx: ExecutionContext,
) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let pm = ctx
            .process_manager
            .clone()
            .ok_or_else(|| ToolError::Unavailable("process supervisor not configured".into()))?;
        let all = args.get("all").and_then(Value::as_bool).unwrap_or(false);
        let filter = if all { None } else { Some(ctx.agent_name.as_str()) };

        let processes: Vec<Value> = pm
            .list(filter)
            .await
            .into_iter()
            .map(|p| {
                json!({
                    "pid": p.pid,
                    "command": p.command,
                    "status": p.status.as_str(),
                    "exit_code": p.exit_code,
                    "kind": p.kind,
                    "started_at": p.started_at.to_rfc3339(),
                    "callbacks": p.callbacks.len(),
                })
            })
            .collect();
        Ok(json!({"count": processes.len(), "processes": processes}))
    })
}

fn stop_process(
    args: Value,
    ctx: ExecutionContext,
) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let pm = ctx
            .process_manager
            .clone()
            .ok_or_else(|| ToolError::Unavailable("process supervisor not configured".into()))?;
        let pid = optional_u64(&args, "pid")
            .ok_or_else(|| ToolError::InvalidArguments("missing required argument 'pid'".into()))?
            as u32;
        let killed = pm.kill(pid, None).await;
        if !killed {
            return Err(ToolError::NotFound(format!(
                "no running process with pid {pid}"
            )));
        }
        Ok(json!({"pid": pid, "killed": true}))
    })
}

fn add_process_callbacks(
    args: Value,
    ctx: ExecutionContext,
) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let pm = ctx
            .process_manager
            .clone()
            .ok_or_else(|| ToolError::Unavailable("process supervisor not configured".into()))?;
        let pid = optional_u64(&args, "pid")
            .ok_or_else(|| ToolError::InvalidArguments("missing required argument 'pid'".into()))?
            as u32;
        let raw = args
            .get("callbacks")
            .ok_or_else(|| ToolError::InvalidArguments("missing required argument 'callbacks'".into()))?
            .to_string();
        let callbacks = parse_callbacks(&raw, DEFAULT_OUTPUT_DELAY);
        if callbacks.is_empty() {
            return Err(ToolError::InvalidArguments(
                "no valid callbacks in 'callbacks'".into(),
            ));
        }
        let added = callbacks.len();

        match pm.add_callbacks(pid, callbacks).await {
            Some(snapshot) => Ok(json!({
                "pid": pid,
                "added": added,
                "total_callbacks": snapshot.callbacks.len(),
            })),
            None => Err(ToolError::NotFound(format!(
                "no running process with pid {pid}"
            ))),
        }
    })
}

const CALLBACK_SCHEMA_HINT: &str =
    "Array of callback objects: {trigger: {type: on_exit|on_output_match|on_timeout, \
     exit_filter?, pattern?, timeout_seconds?}, action: stop_process|stop_branch|\
     inject_context|spawn_branch|notify_channel, context_message?, output_delay_seconds?, \
     max_fires?, min_message_interval?}";

/// The built-in process tools.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "run_process",
            "Run a command as a tracked subprocess with lifecycle hooks. \
             Use kind 'background' for long-running services; hooks fire on \
             exit, output matches, or timeouts.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"},
                    "kind": {
                        "type": "string",
                        "enum": ["concurrent", "background"],
                        "description": "How the process relates to this branch (default concurrent)",
                    },
                    "callbacks": {"type": "array", "description": CALLBACK_SCHEMA_HINT},
                    "context": {"type": "string", "description": "Why this process was started"},
                    "model_for_hooks": {
                        "type": "string",
                        "description": "Model for branches spawned by this process's hooks",
                    },
                },
                "required": ["command"],
            }),
            vec!["workspace", "agent_name", "branch_id"],
            Arc::new(run_process) as ToolHandler,
        ),
        ToolDefinition::new(
            "list_processes",
            "List tracked subprocesses for this agent (all agents with all=true).",
            json!({
                "type": "object",
                "properties": {
                    "all": {"type": "boolean", "description": "Include other agents' processes"},
                },
                "required": [],
            }),
            vec!["agent_name"],
            Arc::new(list_processes) as ToolHandler,
        ),
        ToolDefinition::new(
            "stop_process",
            "Stop a tracked subprocess (SIGTERM, then SIGKILL after a grace period).",
            json!({
                "type": "object",
                "properties": {
                    "pid": {"type": "integer", "description": "PID of the tracked process"},
                },
                "required": ["pid"],
            }),
            vec![],
            Arc::new(stop_process) as ToolHandler,
        ),
        ToolDefinition::new(
            "add_process_callbacks",
            "Attach additional lifecycle hooks to an already-running tracked process.",
            json!({
                "type": "object",
                "properties": {
                    "pid": {"type": "integer", "description": "PID of the tracked process"},
                    "callbacks": {"type": "array", "description": CALLBACK_SCHEMA_HINT},
                },
                "required": ["pid", "callbacks"],
            }),
            vec![],
            Arc::new(add_process_callbacks) as ToolHandler,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_callbacks_fall_back_to_default() {
        let cbs = callbacks_from_args(&json!({"command": "make"}));
        assert_eq!(cbs.len(), 1);
        assert_eq!(cbs[0].context_message, "Process completed");
    }

    #[test]
    fn structured_callbacks_are_parsed() {
        let cbs = callbacks_from_args(&json!({
            "command": "make",
            "callbacks": [{
                "trigger": {"type": "on_output_match", "pattern": "ERROR"},
                "action": "notify_channel",
            }],
        }));
        assert_eq!(cbs.len(), 1);
        assert_eq!(cbs[0].max_fires, 0);
    }

    #[tokio::test]
    async fn tools_require_a_process_manager() {
        let ctx = ExecutionContext::new(
            "/tmp",
            crate::security::policy::preset("open").unwrap(),
            "tester",
        );
        let err = (definitions()[0].handler)(json!({"command": "true"}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(_)));
    }
}
