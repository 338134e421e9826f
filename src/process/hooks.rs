//! The hook dispatcher: evaluates process callbacks and executes their
//! actions.
//!
//! Wired into the process supervisor's `on_line` / `on_exit` / `on_spawn`
//! callbacks.  Actions never reach into a branch's internals directly;
//! they go through small callbacks provided at wiring time, which breaks
//! the branch ↔ supervisor ↔ loop cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::manager::ProcessManager;
use super::models::{CallbackAction, HookTrigger, TrackedProcess};
use super::monitor::StreamKind;

const DELAY_TAIL_LINES: usize = 20;
const SPAWN_CONTEXT_TAIL_LINES: usize = 30;
const MAX_CONCURRENT_HOOK_SPAWNS: usize = 3;

/// Spawns a new autonomous branch in reaction to a hook.
#[async_trait]
pub trait BranchSpawner: Send + Sync {
    async fn spawn_hook_branch(
        &self,
        agent_name: &str,
        hook_context: &str,
        model: Option<&str>,
        recursion_depth: u32,
    );
}

/// `(agent_name, branch_id)` — kill that branch.
pub type BranchKillCallback = Arc<dyn Fn(String, u64) -> BoxFuture<'static, ()> + Send + Sync>;
/// `(agent_name, branch_id, message)` — enqueue a user message on the
/// branch's inject channel.
pub type InjectCallback = Arc<dyn Fn(String, u64, String) -> BoxFuture<'static, ()> + Send + Sync>;
/// `(agent_name, message, process_snapshot)` — surface a notification.
pub type NotifyCallback =
    Arc<dyn Fn(String, String, TrackedProcess) -> BoxFuture<'static, ()> + Send + Sync>;

/// Evaluates callbacks per process event and dispatches their actions.
pub struct HookDispatcher {
    pm: Arc<ProcessManager>,
    branch_spawner: Option<Arc<dyn BranchSpawner>>,
    branch_kill: Option<BranchKillCallback>,
    inject: Option<InjectCallback>,
    notify: Option<NotifyCallback>,
    default_output_delay: f64,
    max_recursion_depth: u32,
    spawn_semaphore: Arc<Semaphore>,
    pending_delays: Mutex<HashMap<(u32, usize), JoinHandle<()>>>,
    timeout_tasks: Mutex<HashMap<u32, Vec<JoinHandle<()>>>>,
}

impl HookDispatcher {
    pub fn new(pm: Arc<ProcessManager>) -> Self {
        Self {
            pm,
            branch_spawner: None,
            branch_kill: None,
            inject: None,
            notify: None,
            default_output_delay: 2.0,
            max_recursion_depth: 3,
            spawn_semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_HOOK_SPAWNS)),
            pending_delays: Mutex::new(HashMap::new()),
            timeout_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_branch_spawner(mut self, spawner: Arc<dyn BranchSpawner>) -> Self {
        self.branch_spawner = Some(spawner);
        self
    }

    pub fn with_branch_kill(mut self, cb: BranchKillCallback) -> Self {
        self.branch_kill = Some(cb);
        self
    }

    pub fn with_inject(mut self, cb: InjectCallback) -> Self {
        self.inject = Some(cb);
        self
    }

    pub fn with_notify(mut self, cb: NotifyCallback) -> Self {
        self.notify = Some(cb);
        self
    }

    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn with_default_output_delay(mut self, seconds: f64) -> Self {
        self.default_output_delay = seconds;
        self
    }

    /// Connect this dispatcher to the process supervisor's callbacks.
    pub fn wire(self: &Arc<Self>) {
        let on_line = {
            let dispatcher = Arc::clone(self);
            Arc::new(move |pid: u32, stream: StreamKind, line: String| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { dispatcher.on_line(pid, stream, line).await })
                    as BoxFuture<'static, ()>
            })
        };
        let on_exit = {
            let dispatcher = Arc::clone(self);
            Arc::new(move |pid: u32, code: Option<i32>| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { dispatcher.on_exit(pid, code).await })
                    as BoxFuture<'static, ()>
            })
        };
        let on_spawn = {
            let dispatcher = Arc::clone(self);
            Arc::new(move |pid: u32| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move { dispatcher.on_spawn(pid).await }) as BoxFuture<'static, ()>
            })
        };
        let on_added = {
            let dispatcher = Arc::clone(self);
            Arc::new(move |pid: u32, indices: Vec<usize>| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::pin(async move {
                    dispatcher.start_timeout_watchers(pid, Some(indices)).await;
                }) as BoxFuture<'static, ()>
            })
        };
        self.pm
            .set_callbacks(Some(on_line), Some(on_exit), Some(on_spawn), Some(on_added));
    }

    // ── Event handlers ───────────────────────────────────────────────────

    async fn on_spawn(self: &Arc<Self>, pid: u32) {
        self.start_timeout_watchers(pid, None).await;
    }

    /// Start `on_timeout` watchers: one timer task per (not yet exhausted)
    /// timeout callback.  `only` restricts to newly added callback indices
    /// so existing watchers keep their single task.
    pub async fn start_timeout_watchers(self: &Arc<Self>, pid: u32, only: Option<Vec<usize>>) {
        let Some(handle) = self.pm.get_handle(pid).await else {
            return;
        };
        let watchers: Vec<(usize, f64)> = {
            let tracked = handle.lock().await;
            tracked
                .callbacks
                .iter()
                .enumerate()
                .filter(|(idx, cb)| {
                    only.as_ref().is_none_or(|set| set.contains(idx))
                        && !cb.exhausted()
                        && matches!(cb.trigger, HookTrigger::OnTimeout { .. })
                })
                .filter_map(|(idx, cb)| match cb.trigger {
                    HookTrigger::OnTimeout { timeout_seconds } => Some((idx, timeout_seconds)),
                    _ => None,
                })
                .collect()
        };

        let mut tasks = self.timeout_tasks.lock().await;
        let entry = tasks.entry(pid).or_default();
        for (idx, seconds) in watchers {
            let dispatcher = Arc::clone(self);
            entry.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                let Some(handle) = dispatcher.pm.get_handle(pid).await else {
                    return;
                };
                {
                    let tracked = handle.lock().await;
                    if tracked.status.is_terminal() {
                        return;
                    }
                    if tracked.callbacks.get(idx).is_none_or(|cb| cb.exhausted()) {
                        return;
                    }
                }
                dispatcher
                    .fire_callback(pid, idx, "Process timed out".to_owned())
                    .await;
            }));
        }
    }

    async fn on_line(self: &Arc<Self>, pid: u32, _stream: StreamKind, line: String) {
        let Some(handle) = self.pm.get_handle(pid).await else {
            return;
        };
        // Evaluate triggers in declaration order under the lock, dispatch
        // after releasing it.
        let matched: Vec<(usize, f64)> = {
            let tracked = handle.lock().await;
            tracked
                .callbacks
                .iter()
                .enumerate()
                .filter(|(_, cb)| {
                    !cb.exhausted()
                        && cb
                            .trigger
                            .compiled_pattern()
                            .is_some_and(|re| re.is_match(&line))
                })
                .map(|(idx, cb)| {
                    let delay = if cb.output_delay_seconds > 0.0 {
                        cb.output_delay_seconds
                    } else {
                        0.0
                    };
                    (idx, delay)
                })
                .collect()
        };

        for (idx, delay) in matched {
            if delay > 0.0 {
                self.schedule_delayed_fire(pid, idx, line.clone(), delay).await;
            } else {
                self.fire_callback(pid, idx, format!("Output matched: {line}"))
                    .await;
            }
        }
    }

    async fn on_exit(self: &Arc<Self>, pid: u32, exit_code: Option<i32>) {
        // Cancel any live timeout watchers for this pid.
        if let Some(tasks) = self.timeout_tasks.lock().await.remove(&pid) {
            for task in tasks {
                task.abort();
            }
        }

        let Some(handle) = self.pm.get_handle(pid).await else {
            return;
        };
        let (matched, command) = {
            let tracked = handle.lock().await;
            let matched: Vec<usize> = tracked
                .callbacks
                .iter()
                .enumerate()
                .filter(|(_, cb)| {
                    !cb.exhausted()
                        && match &cb.trigger {
                            HookTrigger::OnExit { exit_filter } => exit_filter.matches(exit_code),
                            _ => false,
                        }
                })
                .map(|(idx, _)| idx)
                .collect();
            (matched, tracked.command.clone())
        };

        let code_text = exit_code.map_or_else(|| "unknown".to_owned(), |c| c.to_string());
        for idx in matched {
            let context =
                format!("Process exited with code {code_text}. Command: {command}");
            self.fire_callback(pid, idx, context).await;
        }
    }

    // ── Delayed firing ───────────────────────────────────────────────────

    /// Schedule an output-match fire after its delay; the fire context
    /// includes rolling-tail content accumulated during the wait.  The
    /// delay still fires if the process exits in the meantime.
    async fn schedule_delayed_fire(self: &Arc<Self>, pid: u32, idx: usize, line: String, delay: f64) {
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let Some(handle) = dispatcher.pm.get_handle(pid).await else {
                return;
            };
            let recent = {
                let tracked = handle.lock().await;
                tracked.tail_snapshot(DELAY_TAIL_LINES).join("\n")
            };
            let context = format!(
                "Output matched pattern: {line}\nRecent output after delay:\n{recent}"
            );
            dispatcher.fire_callback(pid, idx, context).await;
        });
        self.pending_delays.lock().await.insert((pid, idx), task);
    }

    // ── Firing ───────────────────────────────────────────────────────────

    async fn fire_callback(self: &Arc<Self>, pid: u32, idx: usize, event_context: String) {
        let Some(handle) = self.pm.get_handle(pid).await else {
            return;
        };

        // Mutate counters under the lock; gather everything the action
        // needs, then release before dispatching (StopProcess re-enters
        // the supervisor).
        struct FirePlan {
            action: CallbackAction,
            full_context: String,
            snapshot: TrackedProcess,
            suppressed: Option<u32>,
        }

        let plan: Option<FirePlan> = {
            let mut tracked = handle.lock().await;
            let Some(cb) = tracked.callbacks.get(idx).cloned() else {
                return;
            };
            if cb.exhausted() {
                return;
            }

            let mut full_context = cb.context_message.clone();
            if !event_context.is_empty() {
                if full_context.is_empty() {
                    full_context = event_context.clone();
                } else {
                    full_context = format!("{full_context}\n\n{event_context}");
                }
            }

            let cb_mut = &mut tracked.callbacks[idx];
            cb_mut.fire_count += 1;
            info!(
                pid,
                action = ?cb.action,
                fire = cb_mut.fire_count,
                max = cb_mut.max_fires,
                "firing callback"
            );

            let mut suppressed = None;
            if cb.action == CallbackAction::NotifyChannel {
                let now = Utc::now();
                let within_interval = cb_mut.last_notify_at.is_some_and(|last| {
                    (now - last).num_milliseconds() as f64 / 1000.0 < cb_mut.min_message_interval
                });
                if within_interval {
                    cb_mut.skipped_fires += 1;
                    return;
                }
                suppressed = Some(cb_mut.skipped_fires);
                cb_mut.skipped_fires = 0;
                cb_mut.last_notify_at = Some(now);
            }

            Some(FirePlan {
                action: cb.action,
                full_context,
                snapshot: tracked.clone(),
                suppressed,
            })
        };
        let Some(plan) = plan else { return };

        match plan.action {
            CallbackAction::StopProcess => {
                self.pm.kill(pid, None).await;
            }
            CallbackAction::StopBranch => {
                if let (Some(kill), Some(branch_id)) =
                    (&self.branch_kill, plan.snapshot.spawned_by_branch)
                {
                    kill(plan.snapshot.agent_name.clone(), branch_id).await;
                }
            }
            CallbackAction::InjectContext => {
                if let (Some(inject), Some(branch_id)) =
                    (&self.inject, plan.snapshot.spawned_by_branch)
                {
                    inject(
                        plan.snapshot.agent_name.clone(),
                        branch_id,
                        plan.full_context.clone(),
                    )
                    .await;
                }
            }
            CallbackAction::NotifyChannel => {
                if let Some(notify) = &self.notify {
                    let mut message = plan.full_context.clone();
                    if let Some(suppressed) = plan.suppressed {
                        if suppressed > 0 {
                            message.push_str(&format!(
                                " ({suppressed} notification(s) suppressed)"
                            ));
                        }
                    }
                    notify(
                        plan.snapshot.agent_name.clone(),
                        message,
                        plan.snapshot.clone(),
                    )
                    .await;
                }
            }
            CallbackAction::SpawnBranch => {
                self.spawn_hook_branch(pid, &plan.snapshot, &plan.full_context)
                    .await;
            }
        }
    }

    async fn spawn_hook_branch(&self, pid: u32, tracked: &TrackedProcess, full_context: &str) {
        if tracked.hook_recursion_depth >= self.max_recursion_depth {
            warn!(
                pid,
                depth = tracked.hook_recursion_depth,
                "hook recursion depth exceeded; not spawning branch"
            );
            return;
        }
        let Some(spawner) = &self.branch_spawner else {
            warn!(pid, "no branch spawner configured for spawn_branch action");
            return;
        };

        // Cap concurrent hook-spawned branches.
        let Ok(_permit) = self.spawn_semaphore.acquire().await else {
            return;
        };

        let recent = {
            let tail = tracked.tail_snapshot(SPAWN_CONTEXT_TAIL_LINES);
            if tail.is_empty() {
                "(no output)".to_owned()
            } else {
                tail.join("\n")
            }
        };
        let exit_suffix = tracked
            .exit_code
            .map_or_else(String::new, |c| format!(" (exit {c})"));
        let hook_context = format!(
            "A process hook was triggered.\n\n\
             **Process:** PID {pid}\n\
             **Command:** `{}`\n\
             **Status:** {}{exit_suffix}\n\
             **Trigger context:** {full_context}\n\n\
             **Recent output:**\n```\n{recent}\n```\n\n\
             Respond to this event as instructed.",
            tracked.command,
            tracked.status.as_str(),
        );
        spawner
            .spawn_hook_branch(
                &tracked.agent_name,
                &hook_context,
                tracked.model_for_hooks.as_deref(),
                tracked.hook_recursion_depth + 1,
            )
            .await;
    }
}
