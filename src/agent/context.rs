//! Rolling-window context management and LLM context assembly.
//!
//! All messages are persisted through the [`Store`].  The live window is
//! bounded by `max(now − rolling_window, last_clear)`.  Session snapshots
//! copy the current window to a JSON file plus an index row; they never
//! mutate the live window.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::context::{context_budget_for, truncate_to_budget};
use crate::ai::types::ChatMessage;
use crate::database::store::{SessionMetadata, Store, StoredMessage};
use crate::error::ChorusError;

use super::AgentIdentity;
use super::branches::{BranchSupervisor, build_branch_status};

const DEFAULT_ROLLING_WINDOW_SECS: i64 = 86_400;
const MODEL_HINT_CAP: usize = 20;

/// Generates a summary for a batch of messages (used by snapshots).
pub type Summarizer = Arc<
    dyn Fn(Vec<StoredMessage>) -> BoxFuture<'static, Result<String, ChorusError>> + Send + Sync,
>;

/// Draft of a message to persist; the timestamp is assigned at
/// persistence time.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub role: crate::ai::types::Role,
    pub content: Option<String>,
    pub branch_id: Option<u64>,
    pub tool_calls: Option<Value>,
    pub tool_call_id: Option<String>,
    pub external_message_id: Option<u64>,
}

/// Manages the rolling context window for a single agent.
pub struct ContextManager {
    agent_name: String,
    store: Arc<dyn Store>,
    sessions_dir: PathBuf,
    rolling_window_secs: i64,
}

impl ContextManager {
    pub fn new(
        agent_name: impl Into<String>,
        store: Arc<dyn Store>,
        sessions_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            store,
            sessions_dir: sessions_dir.into(),
            rolling_window_secs: DEFAULT_ROLLING_WINDOW_SECS,
        }
    }

    pub fn with_rolling_window(mut self, seconds: i64) -> Self {
        self.rolling_window_secs = seconds;
        self
    }

    // ── Message persistence ──────────────────────────────────────────────

    /// Store a message with an auto-generated timestamp.
    pub async fn persist_message(&self, draft: MessageDraft) -> Result<(), ChorusError> {
        let message = StoredMessage {
            agent_name: self.agent_name.clone(),
            role: draft.role,
            timestamp: Utc::now().to_rfc3339(),
            branch_id: draft.branch_id,
            content: draft.content,
            tool_calls: draft.tool_calls,
            tool_call_id: draft.tool_call_id,
            external_message_id: draft.external_message_id,
        };
        self.store.persist_message(&message).await?;
        Ok(())
    }

    // ── Context retrieval ────────────────────────────────────────────────

    /// Messages within the rolling window, optionally scoped to a branch.
    pub async fn get_context(
        &self,
        branch_id: Option<u64>,
    ) -> Result<Vec<StoredMessage>, ChorusError> {
        let cutoff = self.compute_cutoff().await?;
        Ok(self
            .store
            .get_messages_since(&self.agent_name, &cutoff, branch_id)
            .await?)
    }

    async fn compute_cutoff(&self) -> Result<String, ChorusError> {
        let rolling_start =
            (Utc::now() - Duration::seconds(self.rolling_window_secs)).to_rfc3339();
        let last_clear = self.store.get_last_clear_time(&self.agent_name).await?;
        Ok(match last_clear {
            Some(clear) if clear > rolling_start => clear,
            _ => rolling_start,
        })
    }

    /// Advance the clear marker to now, excluding prior messages from the
    /// window.
    pub async fn clear(&self) -> Result<(), ChorusError> {
        let now = Utc::now().to_rfc3339();
        self.store
            .set_last_clear_time(&self.agent_name, &now)
            .await?;
        info!(agent = %self.agent_name, at = %now, "cleared context");
        Ok(())
    }

    // ── Session snapshots ────────────────────────────────────────────────

    /// Save the current window to `sessions/<id>.json` plus an index row.
    /// Does NOT clear the window.
    pub async fn save_snapshot(
        &self,
        description: &str,
        summarizer: Option<&Summarizer>,
    ) -> Result<SessionMetadata, ChorusError> {
        let now = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let messages = self.get_context(None).await?;

        let window_start = messages
            .first()
            .map_or_else(|| now.to_rfc3339(), |m| m.timestamp.clone());
        let window_end = messages
            .last()
            .map_or_else(|| now.to_rfc3339(), |m| m.timestamp.clone());

        let summary = match summarizer {
            Some(summarize) => match summarize(messages.clone()).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(session = %session_id, error = %e, "summary generation failed");
                    "(summary generation failed)".to_owned()
                }
            },
            None => String::new(),
        };

        let payload = json!({
            "session_id": session_id,
            "timestamp": now.to_rfc3339(),
            "description": description,
            "summary": summary,
            "message_count": messages.len(),
            "window_start": window_start,
            "window_end": window_end,
            "messages": messages,
        });
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let file_path = self.sessions_dir.join(format!("{session_id}.json"));
        tokio::fs::write(&file_path, serde_json::to_string_pretty(&payload)?).await?;

        let meta = SessionMetadata {
            session_id: session_id.clone(),
            agent_name: self.agent_name.clone(),
            description: description.to_owned(),
            summary,
            saved_at: now.to_rfc3339(),
            message_count: messages.len() as u64,
            file_path: file_path.display().to_string(),
            window_start,
            window_end,
        };
        self.store.save_session(&meta).await?;
        info!(
            session = %session_id,
            agent = %self.agent_name,
            messages = messages.len(),
            "saved session snapshot"
        );
        Ok(meta)
    }

    pub async fn list_snapshots(&self, limit: u32) -> Result<Vec<SessionMetadata>, ChorusError> {
        Ok(self.store.list_sessions(&self.agent_name, limit).await?)
    }

    /// Load a saved session's messages back into the live window.  They
    /// are re-persisted with fresh timestamps so they fall inside the
    /// rolling window.  Returns the number of messages restored.
    pub async fn restore_snapshot(&self, session_id: &str) -> Result<usize, ChorusError> {
        let meta = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChorusError::SessionNotFound(session_id.to_owned()))?;

        let path = PathBuf::from(&meta.file_path);
        if !path.exists() {
            return Err(ChorusError::SessionNotFound(session_id.to_owned()));
        }
        let payload: Value = serde_json::from_str(&tokio::fs::read_to_string(&path).await?)?;
        let messages: Vec<StoredMessage> =
            serde_json::from_value(payload.get("messages").cloned().unwrap_or(json!([])))?;

        let count = messages.len();
        for message in messages {
            self.persist_message(MessageDraft {
                role: message.role,
                content: message.content,
                branch_id: message.branch_id,
                tool_calls: message.tool_calls,
                tool_call_id: message.tool_call_id,
                external_message_id: None,
            })
            .await?;
        }
        info!(session = %session_id, count, "restored session snapshot");
        Ok(count)
    }
}

// ─── Context assembly ──────────────────────────────────────────────────────

/// Non-agent inputs to context assembly.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub model: Option<String>,
    pub available_models: Vec<String>,
    pub previous_branch_summary: Option<String>,
    pub previous_branch_id: Option<u64>,
    /// Mounted host-filesystem scope, if any.
    pub scope_path: Option<PathBuf>,
    /// Whether a dedicated code-editing tool is available.
    pub code_tool_available: bool,
}

fn read_agent_docs(docs_dir: &Path) -> String {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(docs_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
                .collect()
        })
        .unwrap_or_default();
    entries.sort();

    let mut parts: Vec<String> = Vec::new();
    for path in entries {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        parts.push(format!("--- {name} ---\n{content}"));
    }
    parts.join("\n\n")
}

/// Assemble the full message list for an LLM call.
///
/// Order: synthetic system message (prompt + docs + awareness hints);
/// previous-branch summary; branch status block; rolling window messages —
/// then truncated to 80% of the model's capped context limit.
pub async fn build_llm_context(
    agent: &AgentIdentity,
    branch_id: Option<u64>,
    context_manager: &ContextManager,
    branch_supervisor: &BranchSupervisor,
    opts: &ContextOptions,
) -> Result<Vec<ChatMessage>, ChorusError> {
    let mut messages: Vec<ChatMessage> = Vec::new();

    let mut system_parts: Vec<String> = vec![agent.system_prompt.clone()];
    if let Some(docs_dir) = &agent.docs_dir {
        if docs_dir.is_dir() {
            let docs = read_agent_docs(docs_dir);
            if !docs.is_empty() {
                system_parts.push(format!("\n\n## Agent Documentation\n\n{docs}"));
            }
        }
    }

    let effective_model = opts
        .model
        .clone()
        .or_else(|| agent.model.clone())
        .unwrap_or_else(|| "unknown".to_owned());
    system_parts.push(format!("\n\nYou are running on model: {effective_model}."));
    if !opts.available_models.is_empty() {
        let listed: Vec<&str> = opts
            .available_models
            .iter()
            .take(MODEL_HINT_CAP)
            .map(String::as_str)
            .collect();
        system_parts.push(format!("Available models: {}.", listed.join(", ")));
    }

    if let Some(scope) = &opts.scope_path {
        system_parts.push(format!(
            "\n\n## Host Filesystem Access\n\n\
             The host user's filesystem is mounted at `{}`. You can read and \
             write files there using absolute paths in file tools and bash \
             commands. The environment variable `$SCOPE_PATH` is also \
             available in bash and expands to `{}`.",
            scope.display(),
            scope.display()
        ));
    }

    if opts.code_tool_available {
        system_parts.push(
            "\n\n## Code Editing\n\n\
             You have access to the `claude_code` tool for creating and \
             editing code files (.py, .js, .ts, .go, .rs, etc.). Delegate \
             code editing tasks to this tool for better results. For non-code \
             files (.md, .txt, .json, .yaml), use create_file and str_replace."
                .to_owned(),
        );
    }

    system_parts.push(
        "\n\n## File Writing\n\n\
         When creating large files, use `append_file` in multiple tool calls \
         to build the content incrementally. Do NOT try to write an entire \
         large file in a single `create_file` call — the response may be cut \
         off by output token limits. Instead: use `create_file` for the first \
         chunk, then `append_file` for subsequent chunks."
            .to_owned(),
    );

    messages.push(ChatMessage::system(system_parts.join("\n")));

    if let (Some(summary), Some(prev_id)) =
        (&opts.previous_branch_summary, opts.previous_branch_id)
    {
        messages.push(ChatMessage::system(format!(
            "Previous conversation (branch #{prev_id}): {summary}"
        )));
    }

    let status = build_branch_status(branch_supervisor, branch_id.unwrap_or(0)).await;
    if status != "No active branches." {
        messages.push(ChatMessage::system(status));
    }

    for stored in context_manager.get_context(branch_id).await? {
        messages.push(stored.to_chat_message());
    }

    let budget = context_budget_for(Some(effective_model.as_str()));
    Ok(truncate_to_budget(messages, budget))
}
