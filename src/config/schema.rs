//! JSON configuration schema for the Chorus runtime.
//!
//! All fields have `#[serde(default)]` so a partially-filled `config.json`
//! works correctly.  Missing fields fall back to their `Default` values.
//!
//! Example `~/.chorus-agents/config.json`:
//! ```json
//! {
//!   "default_model": "claude-sonnet-4-5",
//!   "default_permissions": "standard",
//!   "idle_timeout_secs": 300,
//!   "max_tool_loop_iterations": 25,
//!   "max_bash_timeout_secs": 600
//! }
//! ```

use serde::{Deserialize, Serialize};

/// Global runtime defaults, stored at `<home>/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChorusConfig {
    /// Model used by agents that do not set one explicitly.
    pub default_model: String,
    /// Permission preset applied to newly created agents.
    pub default_permissions: String,
    /// Seconds of inactivity before an agent's presence goes idle.
    pub idle_timeout_secs: u64,
    /// Iteration cap for the agentic tool loop.
    pub max_tool_loop_iterations: u32,
    /// Upper bound a bash tool call may request as its timeout.
    pub max_bash_timeout_secs: u64,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-sonnet-4-5".to_owned(),
            default_permissions: "standard".to_owned(),
            idle_timeout_secs: 300,
            max_tool_loop_iterations: 25,
            max_bash_timeout_secs: 600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = ChorusConfig::default();
        assert_eq!(cfg.default_permissions, "standard");
        assert_eq!(cfg.max_tool_loop_iterations, 25);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ChorusConfig =
            serde_json::from_str(r#"{"default_model": "gpt-4o"}"#).unwrap();
        assert_eq!(cfg.default_model, "gpt-4o");
        assert_eq!(cfg.idle_timeout_secs, 300);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = ChorusConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: ChorusConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
