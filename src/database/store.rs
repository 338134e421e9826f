//! The typed persistence interface the runtime consumes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::branches::BranchStep;
use crate::ai::types::{ChatMessage, Role, ToolCall};
use crate::process::models::{ProcessStatus, TrackedProcess};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub agent_name: String,
    pub role: Role,
    /// RFC 3339 UTC, assigned at persistence time.
    pub timestamp: String,
    #[serde(default)]
    pub branch_id: Option<u64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub external_message_id: Option<u64>,
}

impl StoredMessage {
    /// Convert to the neutral chat message shape for context assembly.
    pub fn to_chat_message(&self) -> ChatMessage {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls,
            tool_call_id: self.tool_call_id.clone(),
            raw_blocks: None,
        }
    }
}

/// Index row for a saved session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub agent_name: String,
    pub description: String,
    pub summary: String,
    pub saved_at: String,
    pub message_count: u64,
    pub file_path: String,
    pub window_start: String,
    pub window_end: String,
}

/// Durable agent identity, one row per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub channel_id: Option<u64>,
    pub model: Option<String>,
    pub system_prompt: String,
    pub permissions: String,
    pub web_search_enabled: bool,
}

/// Typed persistence operations consumed by the core.  All asynchronous.
#[async_trait]
pub trait Store: Send + Sync {
    async fn register_agent(&self, agent: &AgentRecord) -> Result<(), StoreError>;
    async fn update_agent_field(
        &self,
        agent_name: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError>;
    async fn log_self_edit(
        &self,
        agent_name: &str,
        field: &str,
        old_value: &str,
        new_value: &str,
    ) -> Result<(), StoreError>;

    async fn persist_message(&self, message: &StoredMessage) -> Result<(), StoreError>;
    /// Messages strictly newer than `cutoff`, in timestamp order,
    /// optionally scoped to one branch.
    async fn get_messages_since(
        &self,
        agent_name: &str,
        cutoff: &str,
        branch_id: Option<u64>,
    ) -> Result<Vec<StoredMessage>, StoreError>;
    async fn get_last_clear_time(&self, agent_name: &str) -> Result<Option<String>, StoreError>;
    async fn set_last_clear_time(&self, agent_name: &str, timestamp: &str)
    -> Result<(), StoreError>;

    async fn save_session(&self, meta: &SessionMetadata) -> Result<(), StoreError>;
    async fn list_sessions(
        &self,
        agent_name: &str,
        limit: u32,
    ) -> Result<Vec<SessionMetadata>, StoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionMetadata>, StoreError>;

    async fn insert_process(&self, process: &TrackedProcess) -> Result<(), StoreError>;
    async fn update_process_status(
        &self,
        pid: u32,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Result<(), StoreError>;
    async fn update_process_callbacks(
        &self,
        pid: u32,
        callbacks_json: &str,
    ) -> Result<(), StoreError>;
    async fn list_processes(&self) -> Result<Vec<TrackedProcess>, StoreError>;

    async fn persist_branch_step(
        &self,
        agent_name: &str,
        branch_id: u64,
        step: &BranchStep,
    ) -> Result<(), StoreError>;
}
