//! Tool definitions, handler plumbing, and the execution context.
//!
//! A tool is a named async handler with a JSON-Schema parameter object.
//! Handlers receive the model's validated argument object plus an
//! [`ExecutionContext`]; context values are additionally injected *into*
//! the argument object for each name the tool declares in
//! `context_params`, unless the model already supplied that name (the
//! model's value wins, so a schema parameter that happens to share a
//! context name keeps working).

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::database::store::Store;
use crate::process::manager::ProcessManager;
use crate::security::policy::PermissionProfile;

/// Context parameter names eligible for injection into tool arguments.
pub const CONTEXT_PARAM_NAMES: &[&str] = &[
    "workspace",
    "agent_name",
    "chorus_home",
    "is_admin",
    "host_execution",
    "branch_id",
];

/// Errors a tool handler can produce.  These are recovered into structured
/// `{"error": ...}` results inside the tool loop rather than propagating.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("timeout: command exceeded {0} seconds")]
    Timeout(u64),
    #[error("path traversal: {0} escapes the workspace")]
    PathTraversal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("binary file: {0} is not valid UTF-8")]
    Binary(String),
    #[error("ambiguous match: {0}")]
    AmbiguousMatch(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl ToolError {
    /// Short kind tag used when formatting error results for the model.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "Blocked",
            Self::Timeout(_) => "Timeout",
            Self::PathTraversal(_) => "PathTraversal",
            Self::NotFound(_) => "NotFound",
            Self::Binary(_) => "BinaryFile",
            Self::AmbiguousMatch(_) => "AmbiguousMatch",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::Unavailable(_) => "Unavailable",
            Self::Io(_) => "Io",
            Self::Other(_) => "Error",
        }
    }
}

/// Execution context threaded through every tool invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Tool file operations are jailed inside this directory.
    pub workspace: PathBuf,
    pub profile: PermissionProfile,
    pub agent_name: String,
    pub chorus_home: Option<PathBuf>,
    pub is_admin: bool,
    /// Forward the full host environment to subprocesses.
    pub host_execution: bool,
    pub store: Option<Arc<dyn Store>>,
    pub process_manager: Option<Arc<ProcessManager>>,
    pub branch_id: Option<u64>,
}

impl ExecutionContext {
    pub fn new(
        workspace: impl Into<PathBuf>,
        profile: PermissionProfile,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            profile,
            agent_name: agent_name.into(),
            chorus_home: None,
            is_admin: false,
            host_execution: false,
            store: None,
            process_manager: None,
            branch_id: None,
        }
    }

    /// JSON value for a named context parameter, if it has one.
    pub fn context_value(&self, name: &str) -> Option<Value> {
        match name {
            "workspace" => Some(Value::String(self.workspace.display().to_string())),
            "agent_name" => Some(Value::String(self.agent_name.clone())),
            "chorus_home" => self
                .chorus_home
                .as_ref()
                .map(|p| Value::String(p.display().to_string())),
            "is_admin" => Some(Value::Bool(self.is_admin)),
            "host_execution" => Some(Value::Bool(self.host_execution)),
            "branch_id" => self.branch_id.map(|id| Value::Number(id.into())),
            _ => None,
        }
    }
}

/// Async tool handler: `(arguments, context) -> result value`.
pub type ToolHandler =
    Arc<dyn Fn(Value, ExecutionContext) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A registered tool: metadata plus handler.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    /// Context parameter names this handler consumes (injected when the
    /// model does not supply them).
    pub context_params: Vec<&'static str>,
    pub handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        context_params: Vec<&'static str>,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            context_params,
            handler,
        }
    }

    /// Metadata view suitable for provider tool arrays.
    pub fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("context_params", &self.context_params)
            .finish_non_exhaustive()
    }
}

/// Summary of a registered tool, suitable for inclusion in LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::policy::preset;

    #[test]
    fn context_values_resolve_by_name() {
        let mut ctx = ExecutionContext::new("/tmp/ws", preset("open").unwrap(), "athena");
        ctx.branch_id = Some(7);
        assert_eq!(
            ctx.context_value("workspace"),
            Some(Value::String("/tmp/ws".to_owned()))
        );
        assert_eq!(
            ctx.context_value("agent_name"),
            Some(Value::String("athena".to_owned()))
        );
        assert_eq!(ctx.context_value("is_admin"), Some(Value::Bool(false)));
        assert_eq!(ctx.context_value("branch_id"), Some(Value::Number(7.into())));
        assert_eq!(ctx.context_value("chorus_home"), None);
        assert_eq!(ctx.context_value("nonsense"), None);
    }
}
