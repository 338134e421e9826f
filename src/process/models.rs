//! Data model for tracked subprocesses and their hook callbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum number of lines retained in a process's rolling tail.
pub const ROLLING_TAIL_MAX: usize = 100;

// ─── Enums ─────────────────────────────────────────────────────────────────

/// Lifecycle status of a tracked process.  Transitions are monotonic and
/// terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited,
    Killed,
    /// Found in the store after a restart with no attached monitor.
    Lost,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Lost => "lost",
        }
    }
}

/// How the process relates to the agent's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Concurrent,
    Background,
}

/// Which exit codes satisfy an `on_exit` trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitFilter {
    #[default]
    Any,
    Success,
    Failure,
}

impl ExitFilter {
    pub fn matches(&self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Any => true,
            Self::Success => exit_code == Some(0),
            Self::Failure => exit_code != Some(0),
        }
    }
}

/// What happens when a callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAction {
    StopProcess,
    StopBranch,
    InjectContext,
    SpawnBranch,
    NotifyChannel,
}

// ─── Triggers ──────────────────────────────────────────────────────────────

/// Describes when a callback should fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookTrigger {
    OnExit {
        #[serde(default)]
        exit_filter: ExitFilter,
    },
    OnOutputMatch {
        /// Single-line regex; matching never spans line boundaries because
        /// evaluation happens per delivered line.
        pattern: String,
    },
    OnTimeout {
        timeout_seconds: f64,
    },
}

/// Process-wide cache of compiled output-match patterns.
static PATTERN_CACHE: LazyLock<Mutex<HashMap<String, Option<Regex>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

impl HookTrigger {
    /// Compile (lazily, cached) the regex for an `on_output_match` trigger.
    /// Invalid patterns compile to `None` and never match.
    pub fn compiled_pattern(&self) -> Option<Regex> {
        let Self::OnOutputMatch { pattern } = self else {
            return None;
        };
        let mut cache = PATTERN_CACHE.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .entry(pattern.clone())
            .or_insert_with(|| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid output-match pattern");
                    None
                }
            })
            .clone()
    }
}

// ─── Callbacks ─────────────────────────────────────────────────────────────

fn default_max_fires() -> u32 {
    1
}

fn default_min_message_interval() -> f64 {
    180.0
}

/// A single `(trigger → action)` rule attached to a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCallback {
    pub trigger: HookTrigger,
    pub action: CallbackAction,
    #[serde(default)]
    pub context_message: String,
    /// Delay before an output-match fire, letting subsequent output
    /// accumulate into the fire context.
    #[serde(default)]
    pub output_delay_seconds: f64,
    /// 0 means unlimited.
    #[serde(default = "default_max_fires")]
    pub max_fires: u32,
    #[serde(default)]
    pub fire_count: u32,
    /// Rate-limit window for `notify_channel` fires.
    #[serde(default = "default_min_message_interval")]
    pub min_message_interval: f64,
    #[serde(default)]
    pub skipped_fires: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notify_at: Option<DateTime<Utc>>,
}

impl ProcessCallback {
    pub fn new(trigger: HookTrigger, action: CallbackAction) -> Self {
        Self {
            trigger,
            action,
            context_message: String::new(),
            output_delay_seconds: 0.0,
            max_fires: 1,
            fire_count: 0,
            min_message_interval: default_min_message_interval(),
            skipped_fires: 0,
            last_notify_at: None,
        }
    }

    /// `max_fires = 0` means unlimited; otherwise exhausted once
    /// `fire_count` reaches it.
    pub fn exhausted(&self) -> bool {
        self.max_fires > 0 && self.fire_count >= self.max_fires
    }
}

// ─── TrackedProcess ────────────────────────────────────────────────────────

fn default_status() -> ProcessStatus {
    ProcessStatus::Running
}

/// A subprocess tracked by the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: u32,
    pub command: String,
    pub working_directory: String,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    pub kind: ProcessKind,
    #[serde(default)]
    pub spawned_by_branch: Option<u64>,
    #[serde(default)]
    pub stdout_log: Option<String>,
    #[serde(default)]
    pub stderr_log: Option<String>,
    #[serde(default = "default_status")]
    pub status: ProcessStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub callbacks: Vec<ProcessCallback>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub rolling_tail: VecDeque<String>,
    #[serde(default)]
    pub model_for_hooks: Option<String>,
    #[serde(default)]
    pub hook_recursion_depth: u32,
    #[serde(default)]
    pub external_message_id: Option<u64>,
}

impl TrackedProcess {
    /// Append a line to the rolling tail, evicting the oldest past the cap.
    pub fn push_tail_line(&mut self, line: impl Into<String>) {
        if self.rolling_tail.len() >= ROLLING_TAIL_MAX {
            self.rolling_tail.pop_front();
        }
        self.rolling_tail.push_back(line.into());
    }

    /// The last `n` tail lines, oldest first.
    pub fn tail_snapshot(&self, n: usize) -> Vec<String> {
        let skip = self.rolling_tail.len().saturating_sub(n);
        self.rolling_tail.iter().skip(skip).cloned().collect()
    }
}
