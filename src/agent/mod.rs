//! Agent identity, execution branches, context assembly, and the tool
//! loop.

pub mod branches;
pub mod context;
pub mod loop_;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ChorusError;
use crate::security::policy::PermissionProfile;

pub use branches::{Branch, BranchMetrics, BranchStatus, BranchStep, BranchSupervisor};
pub use context::{ContextManager, ContextOptions, MessageDraft, build_llm_context};
pub use loop_::{ToolLoopEvent, ToolLoopEventKind, ToolLoopOptions, ToolLoopResult, run_tool_loop};

/// A named, durable agent: its workspace, docs, model, permission profile,
/// and channel binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub channel_id: Option<u64>,
    pub model: Option<String>,
    pub system_prompt: String,
    pub permissions_profile: PermissionProfile,
    pub web_search_enabled: bool,
    pub docs_dir: Option<PathBuf>,
}

impl AgentIdentity {
    /// Load an agent's `agent.json` from its directory.
    pub fn load(agent_dir: &Path) -> Result<Self, ChorusError> {
        let text = std::fs::read_to_string(agent_dir.join("agent.json"))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write `agent.json` (and the agent directory skeleton: `workspace/`,
    /// `docs/`).
    pub fn save(&self, agent_dir: &Path) -> Result<(), ChorusError> {
        std::fs::create_dir_all(agent_dir.join("workspace"))?;
        std::fs::create_dir_all(agent_dir.join("docs"))?;
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(agent_dir.join("agent.json"), text)?;
        Ok(())
    }

    /// The agent's jailed workspace directory.
    pub fn workspace_dir(&self, agent_dir: &Path) -> PathBuf {
        agent_dir.join("workspace")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::policy::preset;
    use tempfile::TempDir;

    #[test]
    fn agent_json_round_trips() {
        let dir = TempDir::new().unwrap();
        let agent = AgentIdentity {
            name: "athena".to_owned(),
            channel_id: Some(42),
            model: Some("claude-sonnet-4-5".to_owned()),
            system_prompt: "be helpful".to_owned(),
            permissions_profile: preset("standard").unwrap(),
            web_search_enabled: true,
            docs_dir: None,
        };
        agent.save(dir.path()).unwrap();
        assert!(dir.path().join("workspace").is_dir());
        assert!(dir.path().join("docs").is_dir());

        let loaded = AgentIdentity::load(dir.path()).unwrap();
        assert_eq!(loaded.name, "athena");
        assert_eq!(loaded.channel_id, Some(42));
        assert!(loaded.web_search_enabled);
        assert_eq!(
            loaded.permissions_profile.allow_patterns(),
            agent.permissions_profile.allow_patterns()
        );
    }
}
