//! Execution-branch supervision.
//!
//! Each agent runs its reasoning in concurrent *branches*: cancellable,
//! metered tasks that each drive one tool loop.  The supervisor owns
//! branch identity, metrics, the per-branch inject channel, main-branch
//! selection, reply routing, and per-path file locks that serialize
//! concurrent tool writes across branches of the same agent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::ai::types::ChatMessage;
use crate::database::store::Store;
use crate::error::ChorusError;

const DEFAULT_CLEANUP_AFTER: Duration = Duration::from_secs(600);

// ─── Status and metrics ────────────────────────────────────────────────────

/// Status of an execution branch.  Transitions are monotonic; `Completed`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Idle,
    Running,
    WaitingPermission,
    Completed,
}

/// A single step in a branch's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStep {
    pub step_number: u32,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Timing and step tracking for a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchMetrics {
    pub created_at: DateTime<Utc>,
    pub step_number: u32,
    pub current_step: String,
    pub step_history: Vec<BranchStep>,
}

impl BranchMetrics {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            step_number: 0,
            current_step: "Starting".to_owned(),
            step_history: Vec::new(),
        }
    }

    /// Wall-clock time since branch creation, in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }

    /// End the current step (if open) and start a new one.  Returns the
    /// step that was closed, for persistence.
    pub fn begin_step(&mut self, description: impl Into<String>) -> Option<BranchStep> {
        let now = Utc::now();
        let closed = self.close_open_step(now);
        self.step_number += 1;
        let description = description.into();
        self.current_step = description.clone();
        self.step_history.push(BranchStep {
            step_number: self.step_number,
            description,
            started_at: now,
            ended_at: None,
            duration_ms: None,
        });
        closed
    }

    /// Close the last open step.  Returns it if one was open.
    pub fn finalize(&mut self) -> Option<BranchStep> {
        self.close_open_step(Utc::now())
    }

    fn close_open_step(&mut self, now: DateTime<Utc>) -> Option<BranchStep> {
        let last = self.step_history.last_mut()?;
        if last.ended_at.is_some() {
            return None;
        }
        last.ended_at = Some(now);
        last.duration_ms = Some((now - last.started_at).num_milliseconds().max(0));
        Some(last.clone())
    }
}

impl Default for BranchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Branch ────────────────────────────────────────────────────────────────

/// A single execution branch within an agent.
#[derive(Debug)]
pub struct Branch {
    pub id: u64,
    pub agent_name: String,
    pub initial_message: ChatMessage,
    pub status: BranchStatus,
    pub metrics: BranchMetrics,
    pub summary: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_main: bool,
    /// Depth of the hook-spawn chain that created this branch (0 for
    /// user-initiated branches).
    pub hook_recursion_depth: u32,
    /// Outbound message ids produced by this branch (for reply routing).
    pub external_ids: Vec<u64>,
    inject_tx: mpsc::UnboundedSender<ChatMessage>,
    inject_rx: Option<mpsc::UnboundedReceiver<ChatMessage>>,
}

impl Branch {
    fn new(id: u64, agent_name: String, initial_message: ChatMessage, is_main: bool) -> Self {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Self {
            id,
            agent_name,
            initial_message,
            status: BranchStatus::Idle,
            metrics: BranchMetrics::new(),
            summary: None,
            completed_at: None,
            is_main,
            hook_recursion_depth: 0,
            external_ids: Vec::new(),
            inject_tx,
            inject_rx: Some(inject_rx),
        }
    }

    /// Enqueue a user message on the inject channel; the tool loop drains
    /// it at its next iteration boundary.
    pub fn inject(&self, message: ChatMessage) -> bool {
        self.inject_tx.send(message).is_ok()
    }

    /// Take the inject receiver (once, by the runner that drives the loop).
    pub fn take_inject_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ChatMessage>> {
        self.inject_rx.take()
    }

    pub fn is_terminal(&self) -> bool {
        self.status == BranchStatus::Completed
    }
}

/// The async runner a branch task executes.
pub type BranchRunner = Arc<
    dyn Fn(Arc<Mutex<Branch>>) -> BoxFuture<'static, Result<(), ChorusError>> + Send + Sync,
>;

// ─── Supervisor ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    branches: HashMap<u64, Arc<Mutex<Branch>>>,
    external_to_branch: HashMap<u64, u64>,
    main_branch: Option<u64>,
    next_id: u64,
}

#[derive(Default)]
struct FileLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
    held: HashMap<(u64, String), OwnedMutexGuard<()>>,
}

/// Manages concurrent execution branches for a single agent.
pub struct BranchSupervisor {
    agent_name: String,
    store: Option<Arc<dyn Store>>,
    cleanup_after: Duration,
    registry: Mutex<Registry>,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    file_locks: Mutex<FileLocks>,
}

impl BranchSupervisor {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            store: None,
            cleanup_after: DEFAULT_CLEANUP_AFTER,
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Default::default()
            }),
            tasks: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(FileLocks::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cleanup_after(mut self, window: Duration) -> Self {
        self.cleanup_after = window;
        self
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Create a new branch (Idle, not yet started).
    pub async fn create(
        &self,
        initial_message: ChatMessage,
        is_main: bool,
    ) -> Arc<Mutex<Branch>> {
        let mut registry = self.registry.lock().await;
        let id = registry.next_id;
        registry.next_id += 1;
        let branch = Arc::new(Mutex::new(Branch::new(
            id,
            self.agent_name.clone(),
            initial_message,
            is_main,
        )));
        registry.branches.insert(id, Arc::clone(&branch));
        if is_main {
            registry.main_branch = Some(id);
        }
        info!(branch = id, agent = %self.agent_name, is_main, "created branch");
        branch
    }

    /// Start a branch's runner as a task.  The wrapper always transitions
    /// the branch to Completed, finalizes metrics, and releases its file
    /// locks — on success, error, or cancellation (via `kill`).
    pub async fn start(self: &Arc<Self>, branch: Arc<Mutex<Branch>>, runner: BranchRunner) {
        let id = {
            let mut b = branch.lock().await;
            b.status = BranchStatus::Running;
            b.id
        };
        let supervisor = Arc::clone(self);
        let task_branch = Arc::clone(&branch);
        let task = tokio::spawn(async move {
            if let Err(e) = runner(Arc::clone(&task_branch)).await {
                error!(branch = id, error = %e, "branch runner failed");
            }
            supervisor.finalize_branch(&task_branch).await;
        });
        self.tasks.lock().await.insert(id, task);
    }

    async fn finalize_branch(&self, branch: &Arc<Mutex<Branch>>) {
        let (id, closed) = {
            let mut b = branch.lock().await;
            if b.is_terminal() {
                (b.id, None)
            } else {
                b.status = BranchStatus::Completed;
                b.completed_at = Some(Utc::now());
                let closed = b.metrics.finalize();
                (b.id, closed)
            }
        };
        self.release_all_for_branch(id).await;
        if let Some(step) = closed {
            self.persist_step(id, &step).await;
        }
    }

    /// Cancel a branch's task and mark it completed.  Double-kill is a
    /// no-op returning `false`.
    pub async fn kill(&self, branch_id: u64) -> bool {
        let Some(branch) = self.get(branch_id).await else {
            return false;
        };
        {
            let b = branch.lock().await;
            if b.is_terminal() {
                return false;
            }
        }
        if let Some(task) = self.tasks.lock().await.remove(&branch_id) {
            task.abort();
            let _ = task.await;
        }
        self.finalize_branch(&branch).await;
        info!(branch = branch_id, agent = %self.agent_name, "killed branch");
        true
    }

    /// Kill every non-terminal branch.  Returns the count killed.
    pub async fn kill_all(&self) -> usize {
        let ids: Vec<u64> = {
            let registry = self.registry.lock().await;
            registry.branches.keys().copied().collect()
        };
        let mut count = 0;
        for id in ids {
            if self.kill(id).await {
                count += 1;
            }
        }
        count
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn get(&self, branch_id: u64) -> Option<Arc<Mutex<Branch>>> {
        self.registry.lock().await.branches.get(&branch_id).cloned()
    }

    pub async fn list_all(&self) -> Vec<Arc<Mutex<Branch>>> {
        let registry = self.registry.lock().await;
        let mut branches: Vec<_> = registry.branches.iter().collect();
        branches.sort_by_key(|(id, _)| **id);
        branches.into_iter().map(|(_, b)| Arc::clone(b)).collect()
    }

    pub async fn list_active(&self) -> Vec<Arc<Mutex<Branch>>> {
        let mut active = Vec::new();
        for branch in self.list_all().await {
            if !branch.lock().await.is_terminal() {
                active.push(branch);
            }
        }
        active
    }

    // ── Reply routing ────────────────────────────────────────────────────

    /// Bind an outbound message id to a branch so replies route back.
    pub async fn register_external(&self, external_id: u64, branch_id: u64) {
        let branch = {
            let mut registry = self.registry.lock().await;
            registry.external_to_branch.insert(external_id, branch_id);
            registry.branches.get(&branch_id).cloned()
        };
        if let Some(branch) = branch {
            branch.lock().await.external_ids.push(external_id);
        }
    }

    /// Look up the branch that produced a given outbound message.
    pub async fn route(&self, external_id: u64) -> Option<Arc<Mutex<Branch>>> {
        let registry = self.registry.lock().await;
        let branch_id = registry.external_to_branch.get(&external_id)?;
        registry.branches.get(branch_id).cloned()
    }

    // ── Main-branch selection ────────────────────────────────────────────

    /// Mark a branch as the agent's main branch.  At most one at a time.
    pub async fn set_main(&self, branch_id: u64) -> Result<(), ChorusError> {
        let mut registry = self.registry.lock().await;
        if !registry.branches.contains_key(&branch_id) {
            return Err(ChorusError::UnknownBranch(branch_id));
        }
        if let Some(previous) = registry.main_branch.take() {
            if let Some(branch) = registry.branches.get(&previous) {
                branch.lock().await.is_main = false;
            }
        }
        registry.main_branch = Some(branch_id);
        if let Some(branch) = registry.branches.get(&branch_id) {
            branch.lock().await.is_main = true;
        }
        Ok(())
    }

    pub async fn get_main(&self) -> Option<Arc<Mutex<Branch>>> {
        let registry = self.registry.lock().await;
        let id = registry.main_branch?;
        registry.branches.get(&id).cloned()
    }

    pub async fn break_main(&self) {
        let mut registry = self.registry.lock().await;
        if let Some(id) = registry.main_branch.take() {
            if let Some(branch) = registry.branches.get(&id) {
                branch.lock().await.is_main = false;
            }
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    /// Remove terminal branches older than the cleanup window.
    pub async fn cleanup_completed(&self) -> usize {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.cleanup_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let mut to_remove: Vec<u64> = Vec::new();
        {
            let registry = self.registry.lock().await;
            for (id, branch) in &registry.branches {
                let b = branch.lock().await;
                if b.is_terminal()
                    && b.completed_at.is_some_and(|done| now - done > window)
                {
                    to_remove.push(*id);
                }
            }
        }

        let mut registry = self.registry.lock().await;
        for id in &to_remove {
            registry.branches.remove(id);
            if registry.main_branch == Some(*id) {
                registry.main_branch = None;
            }
        }
        let Registry {
            branches,
            external_to_branch,
            ..
        } = &mut *registry;
        external_to_branch.retain(|_, branch_id| branches.contains_key(branch_id));
        drop(registry);

        let mut tasks = self.tasks.lock().await;
        for id in &to_remove {
            tasks.remove(id);
        }
        if !to_remove.is_empty() {
            info!(
                count = to_remove.len(),
                agent = %self.agent_name,
                "cleaned up completed branches"
            );
        }
        to_remove.len()
    }

    // ── Steps ────────────────────────────────────────────────────────────

    /// Begin a new metric step on a branch, persisting the step it closed.
    pub async fn begin_step(&self, branch: &Arc<Mutex<Branch>>, description: &str) {
        let (id, closed) = {
            let mut b = branch.lock().await;
            let closed = b.metrics.begin_step(description);
            (b.id, closed)
        };
        if let Some(step) = closed {
            self.persist_step(id, &step).await;
        }
    }

    async fn persist_step(&self, branch_id: u64, step: &BranchStep) {
        if let Some(store) = &self.store {
            if let Err(e) = store
                .persist_branch_step(&self.agent_name, branch_id, step)
                .await
            {
                warn!(branch = branch_id, error = %e, "failed to persist step");
            }
        }
    }

    // ── File locking ─────────────────────────────────────────────────────

    /// Acquire a per-path lock on behalf of a branch.  Returns `false` on
    /// timeout.  Different paths are independent.
    pub async fn acquire_file_lock(
        &self,
        path: &str,
        branch_id: u64,
        timeout: Duration,
    ) -> bool {
        let lock = {
            let mut fl = self.file_locks.lock().await;
            Arc::clone(
                fl.locks
                    .entry(path.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                self.file_locks
                    .lock()
                    .await
                    .held
                    .insert((branch_id, path.to_owned()), guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Release a path lock regardless of owner.
    pub async fn release_file_lock(&self, path: &str) {
        let mut fl = self.file_locks.lock().await;
        let key = fl.held.keys().find(|(_, p)| p == path).cloned();
        if let Some(key) = key {
            fl.held.remove(&key);
        }
    }

    pub async fn is_file_locked(&self, path: &str) -> bool {
        let fl = self.file_locks.lock().await;
        fl.held.keys().any(|(_, p)| p == path)
    }

    /// Release all locks held by a branch (called on branch termination).
    pub async fn release_all_for_branch(&self, branch_id: u64) {
        let mut fl = self.file_locks.lock().await;
        fl.held.retain(|(owner, _), _| *owner != branch_id);
    }
}

// ─── Status formatting ─────────────────────────────────────────────────────

/// Format active branch info for system-prompt injection.
pub async fn build_branch_status(supervisor: &BranchSupervisor, current_branch_id: u64) -> String {
    let mut lines = vec!["Active branches:".to_owned()];
    for branch in supervisor.list_all().await {
        let b = branch.lock().await;
        if b.is_terminal() {
            continue;
        }
        let marker = if b.id == current_branch_id {
            " (this branch)"
        } else {
            ""
        };
        let elapsed_s = b.metrics.elapsed_ms() as f64 / 1000.0;
        let summary = b.summary.as_deref().unwrap_or("Starting...");
        let status = match b.status {
            BranchStatus::Idle => "idle",
            BranchStatus::Running => "running",
            BranchStatus::WaitingPermission => "waiting_for_permission",
            BranchStatus::Completed => "completed",
        };
        lines.push(format!(
            "  #{}{}: {} — step {}, {:.0}s elapsed, currently: {} [{}]",
            b.id, marker, summary, b.metrics.step_number, elapsed_s, b.metrics.current_step, status
        ));
    }
    if lines.len() == 1 {
        return "No active branches.".to_owned();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> ChatMessage {
        ChatMessage::user(text)
    }

    #[tokio::test]
    async fn ids_are_unique_and_monotonic() {
        let sup = BranchSupervisor::new("a");
        let b1 = sup.create(msg("one"), false).await;
        let b2 = sup.create(msg("two"), false).await;
        assert_eq!(b1.lock().await.id, 1);
        assert_eq!(b2.lock().await.id, 2);
    }

    #[tokio::test]
    async fn runner_completion_finalizes_branch() {
        let sup = Arc::new(BranchSupervisor::new("a"));
        let branch = sup.create(msg("hi"), false).await;
        let runner: BranchRunner = Arc::new(|branch| {
            Box::pin(async move {
                branch.lock().await.metrics.begin_step("working");
                Ok(())
            })
        });
        sup.start(Arc::clone(&branch), runner).await;

        // Wait for the task to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = branch.lock().await;
        assert_eq!(b.status, BranchStatus::Completed);
        assert!(b.completed_at.is_some());
        let step = &b.metrics.step_history[0];
        assert!(step.ended_at.is_some());
        assert!(step.duration_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn kill_cancels_a_running_branch() {
        let sup = Arc::new(BranchSupervisor::new("a"));
        let branch = sup.create(msg("hi"), false).await;
        let runner: BranchRunner = Arc::new(|_branch| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        });
        sup.start(Arc::clone(&branch), runner).await;

        let id = branch.lock().await.id;
        assert!(sup.kill(id).await);
        assert_eq!(branch.lock().await.status, BranchStatus::Completed);
        // Double-kill is a no-op.
        assert!(!sup.kill(id).await);
    }

    #[tokio::test]
    async fn kill_all_counts_active_only() {
        let sup = Arc::new(BranchSupervisor::new("a"));
        let _idle = sup.create(msg("idle"), false).await;
        let running = sup.create(msg("running"), false).await;
        let runner: BranchRunner = Arc::new(|_b| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        });
        sup.start(Arc::clone(&running), runner).await;
        // Both the idle and the running branch are non-terminal.
        assert_eq!(sup.kill_all().await, 2);
        assert_eq!(sup.kill_all().await, 0);
    }

    #[tokio::test]
    async fn external_routing_finds_the_branch() {
        let sup = BranchSupervisor::new("a");
        let branch = sup.create(msg("hi"), false).await;
        let id = branch.lock().await.id;
        sup.register_external(555, id).await;
        let routed = sup.route(555).await.unwrap();
        assert_eq!(routed.lock().await.id, id);
        assert!(sup.route(556).await.is_none());
        assert_eq!(branch.lock().await.external_ids, vec![555]);
    }

    #[tokio::test]
    async fn main_branch_selection() {
        let sup = BranchSupervisor::new("a");
        let b1 = sup.create(msg("one"), true).await;
        assert_eq!(sup.get_main().await.unwrap().lock().await.id, 1);

        let _b2 = sup.create(msg("two"), false).await;
        // Creating a non-main branch does not displace main.
        assert_eq!(sup.get_main().await.unwrap().lock().await.id, 1);

        sup.set_main(2).await.unwrap();
        assert_eq!(sup.get_main().await.unwrap().lock().await.id, 2);
        assert!(!b1.lock().await.is_main);

        sup.break_main().await;
        assert!(sup.get_main().await.is_none());

        assert!(matches!(
            sup.set_main(99).await,
            Err(ChorusError::UnknownBranch(99))
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_old_terminal_branches() {
        let sup = Arc::new(
            BranchSupervisor::new("a").with_cleanup_after(Duration::from_millis(10)),
        );
        let branch = sup.create(msg("hi"), true).await;
        let id = branch.lock().await.id;
        sup.register_external(9, id).await;

        let runner: BranchRunner = Arc::new(|_b| Box::pin(async { Ok(()) }));
        sup.start(Arc::clone(&branch), runner).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(sup.cleanup_completed().await, 1);
        assert!(sup.get(id).await.is_none());
        assert!(sup.route(9).await.is_none());
        assert!(sup.get_main().await.is_none());
    }

    #[tokio::test]
    async fn inject_channel_delivers_in_order() {
        let sup = BranchSupervisor::new("a");
        let branch = sup.create(msg("hi"), false).await;
        {
            let b = branch.lock().await;
            assert!(b.inject(ChatMessage::user("first")));
            assert!(b.inject(ChatMessage::user("second")));
        }
        let mut rx = branch.lock().await.take_inject_rx().unwrap();
        assert_eq!(rx.try_recv().unwrap().content.as_deref(), Some("first"));
        assert_eq!(rx.try_recv().unwrap().content.as_deref(), Some("second"));
        assert!(rx.try_recv().is_err());
        // The receiver can only be taken once.
        assert!(branch.lock().await.take_inject_rx().is_none());
    }

    #[tokio::test]
    async fn file_locks_serialize_same_path_only() {
        let sup = BranchSupervisor::new("a");
        assert!(
            sup.acquire_file_lock("notes.md", 1, Duration::from_millis(50))
                .await
        );
        assert!(sup.is_file_locked("notes.md").await);
        // Same path from another branch times out.
        assert!(
            !sup.acquire_file_lock("notes.md", 2, Duration::from_millis(50))
                .await
        );
        // Different path is independent.
        assert!(
            sup.acquire_file_lock("other.md", 2, Duration::from_millis(50))
                .await
        );

        sup.release_file_lock("notes.md").await;
        assert!(!sup.is_file_locked("notes.md").await);
        assert!(
            sup.acquire_file_lock("notes.md", 2, Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn branch_termination_releases_its_locks() {
        let sup = Arc::new(BranchSupervisor::new("a"));
        let branch = sup.create(msg("hi"), false).await;
        let id = branch.lock().await.id;
        assert!(
            sup.acquire_file_lock("shared.txt", id, Duration::from_millis(50))
                .await
        );

        let runner: BranchRunner = Arc::new(|_b| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
        });
        sup.start(Arc::clone(&branch), runner).await;
        sup.kill(id).await;
        assert!(!sup.is_file_locked("shared.txt").await);
    }

    #[tokio::test]
    async fn metrics_steps_are_ordered_and_closed() {
        let mut metrics = BranchMetrics::new();
        assert!(metrics.begin_step("one").is_none());
        let closed = metrics.begin_step("two").unwrap();
        assert_eq!(closed.description, "one");
        assert!(closed.duration_ms.unwrap() >= 0);
        let last = metrics.finalize().unwrap();
        assert_eq!(last.description, "two");
        assert_eq!(metrics.step_number, 2);
        // Finalize again is a no-op.
        assert!(metrics.finalize().is_none());
    }

    #[tokio::test]
    async fn status_block_formats_active_branches() {
        let sup = BranchSupervisor::new("a");
        assert_eq!(build_branch_status(&sup, 0).await, "No active branches.");
        let branch = sup.create(msg("hi"), false).await;
        branch.lock().await.summary = Some("Investigating logs".to_owned());
        let text = build_branch_status(&sup, 1).await;
        assert!(text.contains("#1 (this branch)"));
        assert!(text.contains("Investigating logs"));
        assert!(text.contains("[idle]"));
    }
}
