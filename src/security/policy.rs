//! Regex-based permission engine.
//!
//! Every gated operation is reduced to a canonical action string of the
//! form `tool:<category>:<detail>` and checked against an agent's
//! [`PermissionProfile`]: the first `allow` pattern that matches wins, then
//! the first `ask` pattern, otherwise the action is denied.  Matching is
//! case-sensitive, anchored to the whole action string, and never crosses
//! newlines — a detail string containing a newline fails every
//! single-line pattern on purpose.

use regex::Regex;
use serde::{Deserialize, Serialize};

// ─── Public types ──────────────────────────────────────────────────────────

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    /// The operation may proceed immediately.
    Allow,
    /// The operation requires explicit user approval before proceeding.
    Ask,
    /// The operation is prohibited.
    Deny,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown permission preset: {0}")]
    UnknownPreset(String),
    #[error("invalid permission pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
}

/// Serialized form of a profile: two ordered pattern lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileData {
    allow: Vec<String>,
    ask: Vec<String>,
}

/// An agent's permission profile.
///
/// Patterns are compiled once at construction; an invalid regex is a fatal
/// construction error rather than a silent deny.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ProfileData", into = "ProfileData")]
pub struct PermissionProfile {
    allow: Vec<String>,
    ask: Vec<String>,
    compiled_allow: Vec<Regex>,
    compiled_ask: Vec<Regex>,
}

impl PermissionProfile {
    pub fn new(allow: Vec<String>, ask: Vec<String>) -> Result<Self, PolicyError> {
        let compiled_allow = compile_patterns(&allow)?;
        let compiled_ask = compile_patterns(&ask)?;
        Ok(Self {
            allow,
            ask,
            compiled_allow,
            compiled_ask,
        })
    }

    /// The raw allow patterns, in priority order.
    pub fn allow_patterns(&self) -> &[String] {
        &self.allow
    }

    /// The raw ask patterns, in priority order.
    pub fn ask_patterns(&self) -> &[String] {
        &self.ask
    }
}

impl TryFrom<ProfileData> for PermissionProfile {
    type Error = PolicyError;

    fn try_from(data: ProfileData) -> Result<Self, Self::Error> {
        Self::new(data.allow, data.ask)
    }
}

impl From<PermissionProfile> for ProfileData {
    fn from(profile: PermissionProfile) -> Self {
        Self {
            allow: profile.allow,
            ask: profile.ask,
        }
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            // Anchor to the full action string.  `.` does not match `\n`,
            // so multi-line details fail single-line patterns.
            Regex::new(&format!("^(?:{p})$")).map_err(|e| PolicyError::InvalidPattern {
                pattern: p.clone(),
                source: Box::new(e),
            })
        })
        .collect()
}

// ─── Checking ──────────────────────────────────────────────────────────────

/// Build the canonical action string for a permission check.
pub fn format_action(category: &str, detail: &str) -> String {
    format!("tool:{category}:{detail}")
}

/// Check an action string against a profile.
///
/// Pure: the decision depends only on the action string and the profile's
/// pattern lists.
pub fn check(action: &str, profile: &PermissionProfile) -> PermissionDecision {
    if profile.compiled_allow.iter().any(|re| re.is_match(action)) {
        return PermissionDecision::Allow;
    }
    if profile.compiled_ask.iter().any(|re| re.is_match(action)) {
        return PermissionDecision::Ask;
    }
    PermissionDecision::Deny
}

// ─── Presets ───────────────────────────────────────────────────────────────

/// Build one of the built-in permission presets.
///
/// * `open` — everything allowed.
/// * `standard` — file and read-only git operations allowed; bash, git
///   push, self-edits, web search and process spawning ask first.
/// * `locked` — read-only info surface only.
pub fn preset(name: &str) -> Result<PermissionProfile, PolicyError> {
    let owned = |patterns: &[&str]| patterns.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();
    match name {
        "open" => PermissionProfile::new(owned(&[r".*"]), vec![]),
        "standard" => PermissionProfile::new(
            owned(&[
                r"tool:file:.*",
                r"tool:git:init .*",
                r"tool:git:commit .*",
                r"tool:git:branch .*",
                r"tool:git:checkout .*",
                r"tool:git:diff .*",
                r"tool:git:log .*",
                r"tool:self_edit:docs .*",
                r"tool:info:.*",
            ]),
            owned(&[
                r"tool:bash:.*",
                r"tool:git:.*",
                r"tool:self_edit:.*",
                r"tool:web_search:.*",
                r"tool:claude_code:.*",
                r"tool:run_concurrent:.*",
                r"tool:run_background:.*",
                r"tool:agent_comm:.*",
            ]),
        ),
        "locked" => PermissionProfile::new(owned(&[r"tool:info:.*"]), vec![]),
        other => Err(PolicyError::UnknownPreset(other.to_owned())),
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(allow: &[&str], ask: &[&str]) -> PermissionProfile {
        PermissionProfile::new(
            allow.iter().map(|s| (*s).to_owned()).collect(),
            ask.iter().map(|s| (*s).to_owned()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn allow_match_returns_allow() {
        let p = profile(&[r"tool:file:.*"], &[r"tool:file:.*"]);
        assert_eq!(check("tool:file:/src/app.py", &p), PermissionDecision::Allow);
    }

    #[test]
    fn allow_checked_before_ask() {
        let p = profile(&[r"tool:bash:echo.*"], &[r"tool:bash:.*"]);
        assert_eq!(check("tool:bash:echo hello", &p), PermissionDecision::Allow);
        assert_eq!(check("tool:bash:rm -rf /tmp/junk", &p), PermissionDecision::Ask);
    }

    #[test]
    fn no_match_denies() {
        let p = profile(&[r"tool:file:.*"], &[r"tool:bash:.*"]);
        assert_eq!(
            check("tool:self_edit:system_prompt", &p),
            PermissionDecision::Deny
        );
    }

    #[test]
    fn empty_profile_denies_everything() {
        let p = profile(&[], &[]);
        assert_eq!(check("tool:file:README.md", &p), PermissionDecision::Deny);
        assert_eq!(check("tool:bash:ls", &p), PermissionDecision::Deny);
    }

    #[test]
    fn matching_is_anchored_to_the_full_string() {
        let p = profile(&[r"tool:bash:pip install.*"], &[]);
        assert_eq!(
            check("tool:bash:pip install requests", &p),
            PermissionDecision::Allow
        );
        assert_eq!(
            check("tool:bash:pip uninstall requests", &p),
            PermissionDecision::Deny
        );
        // Prefix alone must not match.
        let p = profile(&[r"tool:bash:echo"], &[]);
        assert_eq!(check("tool:bash:echo hello", &p), PermissionDecision::Deny);
    }

    #[test]
    fn multiline_action_not_matched_across_lines() {
        let p = profile(&[r"tool:bash:.*"], &[]);
        assert_eq!(
            check("tool:bash:echo hello\nrm -rf /", &p),
            PermissionDecision::Deny
        );
    }

    #[test]
    fn regex_special_chars_in_action_handled() {
        let p = profile(&[r"tool:bash:echo \[test\]"], &[]);
        assert_eq!(check("tool:bash:echo [test]", &p), PermissionDecision::Allow);
        assert_eq!(check("tool:bash:echo test", &p), PermissionDecision::Deny);
    }

    #[test]
    fn colons_in_detail_are_fine() {
        let p = profile(&[r"tool:bash:echo a:b:c"], &[]);
        assert_eq!(check("tool:bash:echo a:b:c", &p), PermissionDecision::Allow);
    }

    #[test]
    fn empty_detail_string() {
        let p = profile(&[r"tool:bash:"], &[]);
        assert_eq!(check("tool:bash:", &p), PermissionDecision::Allow);
    }

    #[test]
    fn format_action_produces_canonical_string() {
        assert_eq!(
            format_action("bash", "pip install requests"),
            "tool:bash:pip install requests"
        );
        assert_eq!(format_action("file", "/src/app.py"), "tool:file:/src/app.py");
        assert_eq!(format_action("bash", ""), "tool:bash:");
    }

    #[test]
    fn invalid_regex_fails_at_construction() {
        assert!(PermissionProfile::new(vec!["[invalid".to_owned()], vec![]).is_err());
        assert!(PermissionProfile::new(vec![], vec!["(unclosed".to_owned()]).is_err());
    }

    #[test]
    fn preset_open_allows_everything() {
        let p = preset("open").unwrap();
        assert_eq!(check("tool:file:/anything", &p), PermissionDecision::Allow);
        assert_eq!(check("tool:bash:rm -rf /", &p), PermissionDecision::Allow);
        assert_eq!(
            check("tool:self_edit:system_prompt", &p),
            PermissionDecision::Allow
        );
    }

    #[test]
    fn preset_standard_decisions() {
        let p = preset("standard").unwrap();
        assert_eq!(check("tool:file:/src/app.py", &p), PermissionDecision::Allow);
        assert_eq!(
            check("tool:git:commit {\"message\":\"init\"}", &p),
            PermissionDecision::Allow
        );
        assert_eq!(
            check("tool:bash:pip install requests", &p),
            PermissionDecision::Ask
        );
        assert_eq!(
            check("tool:git:push {\"remote\":\"origin\"}", &p),
            PermissionDecision::Ask
        );
        assert_eq!(
            check("tool:self_edit:system_prompt", &p),
            PermissionDecision::Ask
        );
        assert_eq!(
            check("tool:self_edit:docs README.md", &p),
            PermissionDecision::Allow
        );
        assert_eq!(check("tool:web_search:enabled", &p), PermissionDecision::Ask);
    }

    #[test]
    fn preset_locked_denies_almost_everything() {
        let p = preset("locked").unwrap();
        assert_eq!(check("tool:info:", &p), PermissionDecision::Allow);
        assert_eq!(check("tool:file:/src/app.py", &p), PermissionDecision::Deny);
        assert_eq!(check("tool:bash:ls", &p), PermissionDecision::Deny);
        assert_eq!(check("tool:web_search:enabled", &p), PermissionDecision::Deny);
    }

    #[test]
    fn unknown_preset_errors() {
        assert!(matches!(
            preset("nonexistent"),
            Err(PolicyError::UnknownPreset(_))
        ));
    }

    #[test]
    fn profile_serde_round_trip_is_idempotent() {
        let p = profile(&[r"tool:file:.*"], &[r"tool:bash:.*"]);
        let once = serde_json::to_string(&p).unwrap();
        let back: PermissionProfile = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&back).unwrap();
        assert_eq!(once, twice);
        assert_eq!(back.allow_patterns(), p.allow_patterns());
        assert_eq!(back.ask_patterns(), p.ask_patterns());
    }
}
