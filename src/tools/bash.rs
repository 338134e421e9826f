//! Shell execution tool with a sanitized environment and a command
//! blocklist.
//!
//! By default subprocesses see only an allowlisted set of environment
//! variables with `HOME` jailed to the agent workspace.  Host-execution
//! mode forwards the full host environment instead.  `PYTHONUNBUFFERED=1`
//! is always set so piped stdout arrives line-by-line instead of only when
//! the libc buffer fills.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::warn;

use super::traits::{ExecutionContext, ToolDefinition, ToolError, ToolHandler};
use super::{optional_u64, require_str};

/// Environment variables forwarded to sandboxed subprocesses.
pub const ALLOWED_ENV_VARS: &[&str] = &["PATH", "LANG", "LC_ALL", "TZ", "TERM", "USER", "SHELL"];

const DEFAULT_TIMEOUT_SECS: u64 = 120;
const MAX_OUTPUT_CHARS: usize = 30_000;

/// Destructive command patterns that are refused outright.
static BLOCKLIST: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"rm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rf][a-zA-Z]*\s+/(\s|$)", "recursive delete of /"),
        (r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:", "fork bomb"),
        (r"dd\s+if=/dev/(zero|urandom|random)", "disk overwrite via dd"),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
        (r">\s*/dev/sd[a-z]", "raw device overwrite"),
    ]
    .iter()
    .filter_map(|(pattern, reason)| match Regex::new(pattern) {
        Ok(re) => Some((re, *reason)),
        Err(e) => {
            warn!(pattern, error = %e, "invalid blocklist pattern");
            None
        }
    })
    .collect()
});

/// Return the blocklist reason if the command matches a refused pattern.
pub fn check_blocklist(command: &str) -> Option<&'static str> {
    BLOCKLIST
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, reason)| *reason)
}

/// Build a sanitized environment for subprocess execution.
///
/// * default: allowlisted variables only, `HOME` jailed to the workspace.
/// * `host_execution`: the full host environment, `HOME` untouched.
/// * `scope_home`: overrides `HOME` regardless, so git/ssh find host
///   credentials when a host filesystem scope is mounted.
pub fn sanitized_env(
    workspace: &Path,
    overrides: Option<&HashMap<String, String>>,
    host_execution: bool,
    scope_home: Option<&Path>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = if host_execution {
        std::env::vars().collect()
    } else {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| ALLOWED_ENV_VARS.contains(&k.as_str()))
            .collect();
        env.insert("HOME".to_owned(), workspace.display().to_string());
        env
    };
    if let Some(scope) = scope_home {
        env.insert("HOME".to_owned(), scope.display().to_string());
        env.insert("SCOPE_PATH".to_owned(), scope.display().to_string());
    }
    env.insert("PYTHONUNBUFFERED".to_owned(), "1".to_owned());
    if let Some(overrides) = overrides {
        for (k, v) in overrides {
            env.insert(k.clone(), v.clone());
        }
    }
    env
}

fn truncate_output(text: String) -> (String, bool) {
    if text.len() <= MAX_OUTPUT_CHARS {
        return (text, false);
    }
    let mut cut = MAX_OUTPUT_CHARS;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text[..cut].to_owned();
    truncated.push_str("\n... [output truncated]");
    (truncated, true)
}

// ─── Handler ───────────────────────────────────────────────────────────────

fn bash_execute(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let command = require_str(&args, "command")?.to_owned();
        let timeout_secs = optional_u64(&args, "timeout").unwrap_or(DEFAULT_TIMEOUT_SECS);

        if let Some(reason) = check_blocklist(&command) {
            return Err(ToolError::Blocked(reason.to_owned()));
        }

        let env = sanitized_env(&ctx.workspace, None, ctx.host_execution, None);
        let start = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&ctx.workspace)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(output) => output?,
            // Dropping the in-flight wait kills the child (kill_on_drop).
            Err(_) => return Err(ToolError::Timeout(timeout_secs)),
        };

        let (stdout, stdout_truncated) =
            truncate_output(String::from_utf8_lossy(&output.stdout).into_owned());
        let (stderr, stderr_truncated) =
            truncate_output(String::from_utf8_lossy(&output.stderr).into_owned());

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "truncated": stdout_truncated || stderr_truncated,
        }))
    })
}

/// The built-in bash tool.
pub fn definition() -> ToolDefinition {
    ToolDefinition::new(
        "bash",
        "Execute a shell command in the agent's workspace directory. \
         The command runs with a sanitized environment and configurable timeout.",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "timeout": {"type": "number", "description": "Timeout in seconds (default 120)"},
            },
            "required": ["command"],
        }),
        vec!["workspace", "host_execution"],
        Arc::new(bash_execute) as ToolHandler,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::policy::preset;
    use tempfile::TempDir;

    fn ctx(ws: &Path) -> ExecutionContext {
        ExecutionContext::new(ws, preset("open").unwrap(), "tester")
    }

    #[test]
    fn blocklist_catches_destructive_commands() {
        assert!(check_blocklist("rm -rf /").is_some());
        assert!(check_blocklist("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(check_blocklist("mkfs.ext4 /dev/sdb1").is_some());
        assert!(check_blocklist(":(){ :|:& };:").is_some());
        assert!(check_blocklist("echo hello > /dev/sda").is_some());
    }

    #[test]
    fn blocklist_allows_ordinary_commands() {
        assert!(check_blocklist("ls -la").is_none());
        assert!(check_blocklist("rm build/output.txt").is_none());
        assert!(check_blocklist("cargo build").is_none());
        assert!(check_blocklist("echo mkfs_is_a_word_here").is_none());
    }

    #[test]
    fn sanitized_env_jails_home_and_filters() {
        let ws = TempDir::new().unwrap();
        let env = sanitized_env(ws.path(), None, false, None);
        assert_eq!(env.get("HOME").map(String::as_str), ws.path().to_str());
        assert_eq!(env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        for key in env.keys() {
            assert!(
                ALLOWED_ENV_VARS.contains(&key.as_str())
                    || key == "HOME"
                    || key == "PYTHONUNBUFFERED",
                "unexpected env var {key}"
            );
        }
    }

    #[test]
    fn scope_home_overrides_home() {
        let ws = TempDir::new().unwrap();
        let scope = Path::new("/mnt/host");
        let env = sanitized_env(ws.path(), None, false, Some(scope));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/mnt/host"));
    }

    #[test]
    fn host_execution_forwards_everything() {
        let ws = TempDir::new().unwrap();
        let env = sanitized_env(ws.path(), None, true, None);
        // The full host environment passes through, HOME not jailed.
        assert_ne!(env.get("HOME").map(String::as_str), ws.path().to_str());
        assert!(env.len() >= std::env::vars().count());
    }

    #[test]
    fn overrides_win() {
        let ws = TempDir::new().unwrap();
        let mut overrides = HashMap::new();
        overrides.insert("EXTRA".to_owned(), "yes".to_owned());
        let env = sanitized_env(ws.path(), Some(&overrides), false, None);
        assert_eq!(env.get("EXTRA").map(String::as_str), Some("yes"));
    }

    #[tokio::test]
    async fn executes_and_captures_output() {
        let ws = TempDir::new().unwrap();
        let result = (definition().handler)(
            json!({"command": "echo out && echo err 1>&2"}),
            ctx(ws.path()),
        )
        .await
        .unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "out");
        assert_eq!(result["stderr"].as_str().unwrap().trim(), "err");
        assert_eq!(result["exit_code"], 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let ws = TempDir::new().unwrap();
        let result = (definition().handler)(json!({"command": "exit 3"}), ctx(ws.path()))
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 3);
    }

    #[tokio::test]
    async fn timeout_produces_timeout_error() {
        let ws = TempDir::new().unwrap();
        let err = (definition().handler)(
            json!({"command": "sleep 10", "timeout": 1}),
            ctx(ws.path()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(1)));
    }

    #[tokio::test]
    async fn blocked_command_is_refused() {
        let ws = TempDir::new().unwrap();
        let err = (definition().handler)(json!({"command": "rm -rf /"}), ctx(ws.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Blocked(_)));
    }

    #[test]
    fn truncation_marks_long_output() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 10);
        let (text, truncated) = truncate_output(long);
        assert!(truncated);
        assert!(text.ends_with("[output truncated]"));
    }
}
