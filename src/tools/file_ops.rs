//! File tools: create, append, replace, view.
//!
//! All paths are jailed to the agent workspace: relative paths resolve
//! inside it and the resolved real path must remain a descendant.
//! Absolute paths are only honored under host-execution mode (used when a
//! host filesystem scope is mounted).

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Value, json};

use super::traits::{ExecutionContext, ToolDefinition, ToolError, ToolHandler};
use super::{optional_u64, require_str};

/// Resolve a user-supplied path against the workspace jail.
///
/// The deepest existing ancestor is canonicalized so symlinks cannot lead
/// outside; any `..` surviving in the non-existing tail is rejected.
pub fn resolve_workspace_path(
    workspace: &Path,
    raw: &str,
    host_execution: bool,
) -> Result<PathBuf, ToolError> {
    if raw.contains('\0') {
        return Err(ToolError::InvalidArguments(
            "path contains a null byte".to_owned(),
        ));
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        if host_execution {
            return Ok(path.to_path_buf());
        }
        return Err(ToolError::PathTraversal(raw.to_owned()));
    }

    let workspace_real = workspace.canonicalize()?;
    let joined = workspace_real.join(path);

    let mut existing = joined.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for name in remainder.iter().rev() {
        resolved.push(name);
    }

    let has_parent_component = resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if has_parent_component || !resolved.starts_with(&workspace_real) {
        return Err(ToolError::PathTraversal(raw.to_owned()));
    }
    Ok(resolved)
}

async fn read_text_file(path: &Path, raw: &str) -> Result<String, ToolError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ToolError::NotFound(raw.to_owned()),
            _ => ToolError::Io(e),
        })?;
    String::from_utf8(bytes).map_err(|_| ToolError::Binary(raw.to_owned()))
}

// ─── Handlers ──────────────────────────────────────────────────────────────

fn create_file(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let raw = require_str(&args, "path")?.to_owned();
        let content = require_str(&args, "content")?.to_owned();
        let path = resolve_workspace_path(&ctx.workspace, &raw, ctx.host_execution)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &content).await?;
        Ok(json!({"ok": true, "path": raw, "bytes_written": content.len()}))
    })
}

fn append_file(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let raw = require_str(&args, "path")?.to_owned();
        let content = require_str(&args, "content")?.to_owned();
        let path = resolve_workspace_path(&ctx.workspace, &raw, ctx.host_execution)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut existing = if path.exists() {
            read_text_file(&path, &raw).await?
        } else {
            String::new()
        };
        existing.push_str(&content);
        tokio::fs::write(&path, &existing).await?;
        Ok(json!({"ok": true, "path": raw, "bytes_appended": content.len()}))
    })
}

fn str_replace(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let raw = require_str(&args, "path")?.to_owned();
        let old_str = require_str(&args, "old_str")?.to_owned();
        let new_str = require_str(&args, "new_str")?.to_owned();
        let path = resolve_workspace_path(&ctx.workspace, &raw, ctx.host_execution)?;
        let content = read_text_file(&path, &raw).await?;

        let occurrences = content.matches(&old_str).count();
        if occurrences == 0 {
            return Err(ToolError::NotFound(format!(
                "old_str not found in {raw}"
            )));
        }
        if occurrences > 1 {
            return Err(ToolError::AmbiguousMatch(format!(
                "old_str appears {occurrences} times in {raw}; provide a unique string"
            )));
        }
        let updated = content.replacen(&old_str, &new_str, 1);
        tokio::fs::write(&path, &updated).await?;
        Ok(json!({"ok": true, "path": raw, "replacements": 1}))
    })
}

fn view(args: Value, ctx: ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> {
    Box::pin(async move {
        let raw = require_str(&args, "path")?.to_owned();
        let offset = optional_u64(&args, "offset").unwrap_or(1).max(1) as usize;
        let limit = optional_u64(&args, "limit").map(|n| n as usize);
        let path = resolve_workspace_path(&ctx.workspace, &raw, ctx.host_execution)?;
        let content = read_text_file(&path, &raw).await?;

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let end = limit.map_or(total, |l| (offset - 1 + l).min(total));
        let numbered: Vec<String> = lines
            .iter()
            .enumerate()
            .skip(offset - 1)
            .take(end.saturating_sub(offset - 1))
            .map(|(i, line)| format!("{:>6}\t{line}", i + 1))
            .collect();
        Ok(json!({
            "path": raw,
            "total_lines": total,
            "content": numbered.join("\n"),
        }))
    })
}

// ─── Definitions ───────────────────────────────────────────────────────────

const PATH_DESCRIPTION: &str =
    "File path — relative paths resolve within the workspace; absolute paths require host execution";

/// The built-in file tools.
pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "create_file",
            "Create or overwrite a file in the agent workspace. \
             Intermediate directories are created automatically.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": PATH_DESCRIPTION},
                    "content": {"type": "string", "description": "File content (UTF-8)"},
                },
                "required": ["path", "content"],
            }),
            vec!["workspace"],
            Arc::new(create_file) as ToolHandler,
        ),
        ToolDefinition::new(
            "append_file",
            "Append content to a file, creating it if absent. Use this to \
             build large files incrementally across multiple tool calls.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": PATH_DESCRIPTION},
                    "content": {"type": "string", "description": "Content to append (UTF-8)"},
                },
                "required": ["path", "content"],
            }),
            vec!["workspace"],
            Arc::new(append_file) as ToolHandler,
        ),
        ToolDefinition::new(
            "str_replace",
            "Replace exactly one occurrence of a string in a file. \
             Fails if the string is not found or appears more than once.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": PATH_DESCRIPTION},
                    "old_str": {"type": "string", "description": "Exact string to find (must be unique)"},
                    "new_str": {"type": "string", "description": "Replacement string"},
                },
                "required": ["path", "old_str", "new_str"],
            }),
            vec!["workspace"],
            Arc::new(str_replace) as ToolHandler,
        ),
        ToolDefinition::new(
            "view",
            "View a file's contents with line numbers. \
             Supports optional offset and limit for large files.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": PATH_DESCRIPTION},
                    "offset": {"type": "integer", "description": "1-based line number to start from"},
                    "limit": {"type": "integer", "description": "Number of lines to return"},
                },
                "required": ["path"],
            }),
            vec!["workspace"],
            Arc::new(view) as ToolHandler,
        ),
    ]
}
