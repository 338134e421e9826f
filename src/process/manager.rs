//! The process supervisor: spawns, tracks, kills, lists, and reconciles
//! subprocesses.
//!
//! Tracked processes live behind per-process async mutexes inside the
//! supervisor's map; external readers always get cloned snapshots.
//! Signals are delivered through the system `kill` binary (TERM, then
//! KILL after a grace period).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::database::store::Store;
use crate::error::ChorusError;
use crate::tools::bash::sanitized_env;

use super::models::{ProcessCallback, ProcessKind, ProcessStatus, TrackedProcess};
use super::monitor::{ExitCallback, LineCallback, OutputMonitor};

/// Default SIGTERM grace period before escalating to SIGKILL.
pub const DEFAULT_SIGTERM_GRACE: Duration = Duration::from_secs(5);

/// Path to `stdbuf`, resolved once.  Wrapping commands with `stdbuf -oL`
/// forces line-buffered stdout so output-match hooks see lines in real
/// time instead of when the libc buffer fills.
static STDBUF_PATH: LazyLock<Option<PathBuf>> = LazyLock::new(|| which::which("stdbuf").ok());

fn wrap_with_stdbuf(command: &str) -> String {
    match STDBUF_PATH.as_ref() {
        Some(_) => format!("stdbuf -oL {command}"),
        None => command.to_owned(),
    }
}

/// Invoked right after a process is spawned and registered.
pub type SpawnCallback = Arc<dyn Fn(u32) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked after callbacks are appended to a running process; receives the
/// indices of the newly added callbacks.
pub type CallbacksAddedCallback =
    Arc<dyn Fn(u32, Vec<usize>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default, Clone)]
struct HookWiring {
    on_line: Option<LineCallback>,
    on_exit: Option<ExitCallback>,
    on_spawn: Option<SpawnCallback>,
    on_callbacks_added: Option<CallbacksAddedCallback>,
}

/// Parameters for [`ProcessManager::spawn`].
#[derive(Clone)]
pub struct SpawnRequest {
    pub command: String,
    pub workspace: PathBuf,
    pub agent_name: String,
    pub kind: ProcessKind,
    pub callbacks: Vec<ProcessCallback>,
    pub context: String,
    pub model_for_hooks: Option<String>,
    pub hook_recursion_depth: u32,
    pub spawned_by_branch: Option<u64>,
    pub env_overrides: Option<HashMap<String, String>>,
}

impl SpawnRequest {
    pub fn new(
        command: impl Into<String>,
        workspace: impl Into<PathBuf>,
        agent_name: impl Into<String>,
        kind: ProcessKind,
    ) -> Self {
        Self {
            command: command.into(),
            workspace: workspace.into(),
            agent_name: agent_name.into(),
            kind,
            callbacks: Vec::new(),
            context: String::new(),
            model_for_hooks: None,
            hook_recursion_depth: 0,
            spawned_by_branch: None,
            env_overrides: None,
        }
    }
}

/// Central supervisor for tracked subprocess lifecycle.
pub struct ProcessManager {
    chorus_home: PathBuf,
    store: Option<Arc<dyn Store>>,
    host_execution: bool,
    scope_home: Option<PathBuf>,
    processes: Mutex<HashMap<u32, Arc<Mutex<TrackedProcess>>>>,
    monitors: Mutex<HashMap<u32, OutputMonitor>>,
    wiring: RwLock<HookWiring>,
}

impl ProcessManager {
    pub fn new(chorus_home: impl Into<PathBuf>) -> Self {
        Self {
            chorus_home: chorus_home.into(),
            store: None,
            host_execution: false,
            scope_home: None,
            processes: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            wiring: RwLock::new(HookWiring::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_host_execution(mut self, enabled: bool) -> Self {
        self.host_execution = enabled;
        self
    }

    pub fn with_scope_home(mut self, scope_home: impl Into<PathBuf>) -> Self {
        self.scope_home = Some(scope_home.into());
        self
    }

    /// Wire hook callbacks (done by the hook dispatcher).
    pub fn set_callbacks(
        &self,
        on_line: Option<LineCallback>,
        on_exit: Option<ExitCallback>,
        on_spawn: Option<SpawnCallback>,
        on_callbacks_added: Option<CallbacksAddedCallback>,
    ) {
        let mut wiring = self.wiring.write().unwrap_or_else(|e| e.into_inner());
        wiring.on_line = on_line;
        wiring.on_exit = on_exit;
        wiring.on_spawn = on_spawn;
        wiring.on_callbacks_added = on_callbacks_added;
    }

    fn wiring(&self) -> HookWiring {
        self.wiring.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ── Spawning ─────────────────────────────────────────────────────────

    /// Spawn a subprocess and begin monitoring it.  Registration happens
    /// before monitor start so `on_line`/`on_exit` can resolve the pid.
    pub async fn spawn(
        self: &Arc<Self>,
        request: SpawnRequest,
    ) -> Result<TrackedProcess, ChorusError> {
        let env = sanitized_env(
            &request.workspace,
            request.env_overrides.as_ref(),
            self.host_execution,
            self.scope_home.as_deref(),
        );
        let wrapped = wrap_with_stdbuf(&request.command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&wrapped)
            .current_dir(&request.workspace)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| ChorusError::Process("subprocess has no pid".to_owned()))?;

        let wiring = self.wiring();
        if !request.callbacks.is_empty() && wiring.on_line.is_none() {
            warn!(
                pid,
                callbacks = request.callbacks.len(),
                "spawning with callbacks but no hook dispatcher wired; hooks will not fire"
            );
        }

        let tracked = TrackedProcess {
            pid,
            command: request.command.clone(),
            working_directory: request.workspace.display().to_string(),
            agent_name: request.agent_name.clone(),
            started_at: Utc::now(),
            kind: request.kind,
            spawned_by_branch: request.spawned_by_branch,
            stdout_log: None,
            stderr_log: None,
            status: ProcessStatus::Running,
            exit_code: None,
            callbacks: request.callbacks,
            context: request.context,
            rolling_tail: Default::default(),
            model_for_hooks: request.model_for_hooks,
            hook_recursion_depth: request.hook_recursion_depth,
            external_message_id: None,
        };
        let handle = Arc::new(Mutex::new(tracked));
        self.processes.lock().await.insert(pid, Arc::clone(&handle));

        let log_dir = self
            .chorus_home
            .join("agents")
            .join(&request.agent_name)
            .join("processes")
            .join(pid.to_string());

        let manager = Arc::clone(self);
        let exit_cb: ExitCallback = Arc::new(move |pid, code| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.handle_exit(pid, code).await })
        });

        let monitor = OutputMonitor::start(
            pid,
            child,
            &log_dir,
            Arc::clone(&handle),
            wiring.on_line.clone(),
            exit_cb,
        )
        .await?;

        let snapshot = {
            let mut tracked = handle.lock().await;
            tracked.stdout_log = Some(monitor.stdout_log.display().to_string());
            tracked.stderr_log = Some(monitor.stderr_log.display().to_string());
            tracked.clone()
        };
        self.monitors.lock().await.insert(pid, monitor);

        if let Some(store) = &self.store {
            store.insert_process(&snapshot).await?;
        }

        info!(
            pid,
            agent = %request.agent_name,
            kind = ?request.kind,
            command = %request.command,
            callbacks = snapshot.callbacks.len(),
            "spawned process"
        );

        if let Some(on_spawn) = wiring.on_spawn {
            on_spawn(pid).await;
        }
        Ok(snapshot)
    }

    async fn handle_exit(self: Arc<Self>, pid: u32, exit_code: Option<i32>) {
        let Some(handle) = self.get_handle(pid).await else {
            return;
        };
        let status = {
            let mut tracked = handle.lock().await;
            // An explicit kill may have set the status already; don't
            // overwrite it, just record the observed code.
            if tracked.status != ProcessStatus::Killed {
                tracked.status = ProcessStatus::Exited;
            }
            tracked.exit_code = exit_code;
            tracked.status
        };

        self.persist_status(pid, status, exit_code).await;

        let on_exit = self.wiring().on_exit;
        if let Some(on_exit) = on_exit {
            on_exit(pid, exit_code).await;
        }
        info!(pid, ?exit_code, "process exited");
    }

    // ── Killing ──────────────────────────────────────────────────────────

    /// Kill a tracked process: SIGTERM, wait up to `grace`, then SIGKILL.
    /// Returns `true` if the process was found alive and killed.
    pub async fn kill(&self, pid: u32, grace: Option<Duration>) -> bool {
        let grace = grace.unwrap_or(DEFAULT_SIGTERM_GRACE);
        let Some(handle) = self.get_handle(pid).await else {
            return false;
        };
        {
            let tracked = handle.lock().await;
            if tracked.status.is_terminal() {
                return false;
            }
        }
        let Some(mut exited) = self
            .monitors
            .lock()
            .await
            .get(&pid)
            .map(OutputMonitor::exited)
        else {
            return false;
        };

        send_signal(pid, "TERM").await;
        if tokio::time::timeout(grace, exited.wait_for(|v| v.is_some()))
            .await
            .is_err()
        {
            send_signal(pid, "KILL").await;
            let _ = exited.wait_for(|v| v.is_some()).await;
        }
        let exit_code = exited.borrow().flatten();

        let status = {
            let mut tracked = handle.lock().await;
            if tracked.status == ProcessStatus::Running {
                tracked.status = ProcessStatus::Killed;
            }
            tracked.exit_code = exit_code;
            tracked.status
        };
        self.persist_status(pid, status, exit_code).await;
        info!(pid, "killed process");
        true
    }

    /// Kill all running processes for an agent.  Returns the count killed.
    pub async fn kill_all_for_agent(&self, agent_name: &str) -> usize {
        let pids: Vec<u32> = {
            let processes = self.processes.lock().await;
            let mut pids = Vec::new();
            for (pid, handle) in processes.iter() {
                let tracked = handle.lock().await;
                if tracked.agent_name == agent_name && tracked.status == ProcessStatus::Running {
                    pids.push(*pid);
                }
            }
            pids
        };
        let mut count = 0;
        for pid in pids {
            if self.kill(pid, None).await {
                count += 1;
            }
        }
        count
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub(crate) async fn get_handle(&self, pid: u32) -> Option<Arc<Mutex<TrackedProcess>>> {
        self.processes.lock().await.get(&pid).cloned()
    }

    /// Snapshot of a tracked process.
    pub async fn get(&self, pid: u32) -> Option<TrackedProcess> {
        let handle = self.get_handle(pid).await?;
        let tracked = handle.lock().await;
        Some(tracked.clone())
    }

    /// Snapshots of tracked processes, optionally filtered by agent.
    pub async fn list(&self, agent_name: Option<&str>) -> Vec<TrackedProcess> {
        let handles: Vec<_> = self.processes.lock().await.values().cloned().collect();
        let mut result = Vec::new();
        for handle in handles {
            let tracked = handle.lock().await;
            if agent_name.is_none_or(|a| tracked.agent_name == a) {
                result.push(tracked.clone());
            }
        }
        result.sort_by_key(|p| p.started_at);
        result
    }

    // ── Callbacks on running processes ───────────────────────────────────

    /// Append callbacks to a running process.  No-op (returns `None`) when
    /// the process is terminal or unknown.
    pub async fn add_callbacks(
        &self,
        pid: u32,
        new: Vec<ProcessCallback>,
    ) -> Option<TrackedProcess> {
        let handle = self.get_handle(pid).await?;
        let (snapshot, added) = {
            let mut tracked = handle.lock().await;
            if tracked.status != ProcessStatus::Running {
                return None;
            }
            let start = tracked.callbacks.len();
            tracked.callbacks.extend(new);
            let added: Vec<usize> = (start..tracked.callbacks.len()).collect();
            (tracked.clone(), added)
        };

        if let Some(store) = &self.store {
            match serde_json::to_string(&snapshot.callbacks) {
                Ok(json) => {
                    if let Err(e) = store.update_process_callbacks(pid, &json).await {
                        warn!(pid, error = %e, "failed to persist callbacks");
                    }
                }
                Err(e) => warn!(pid, error = %e, "failed to serialize callbacks"),
            }
        }

        if let Some(cb) = self.wiring().on_callbacks_added {
            cb(pid, added).await;
        }
        Some(snapshot)
    }

    // ── Recovery ─────────────────────────────────────────────────────────

    /// Reconcile store state on startup: every row still marked running is
    /// transitioned to Lost.  A live PID we cannot re-attach to (monitor
    /// file descriptors are gone) is Lost just like a dead one; Lost
    /// processes are reported but never killed, and their hooks never
    /// re-materialize.
    pub async fn recover_on_startup(&self) -> Result<(), ChorusError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let rows = store.list_processes().await?;
        let mut lost = 0;
        for row in rows {
            if row.status != ProcessStatus::Running {
                continue;
            }
            let alive = is_pid_alive(row.pid).await;
            store
                .update_process_status(row.pid, ProcessStatus::Lost, None)
                .await?;
            lost += 1;
            info!(pid = row.pid, alive, "marked stale process lost");
        }
        if lost > 0 {
            info!(lost, "process recovery complete");
        }
        Ok(())
    }

    async fn persist_status(&self, pid: u32, status: ProcessStatus, exit_code: Option<i32>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_process_status(pid, status, exit_code).await {
                warn!(pid, error = %e, "failed to persist process status");
            }
        }
    }
}

async fn send_signal(pid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg(pid.to_string())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, signal, error = %e, "failed to send signal");
    }
}

/// Check whether a PID refers to a live process.
pub async fn is_pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdbuf_wrapping_prepends_when_available() {
        let wrapped = wrap_with_stdbuf("echo hi");
        if STDBUF_PATH.is_some() {
            assert_eq!(wrapped, "stdbuf -oL echo hi");
        } else {
            assert_eq!(wrapped, "echo hi");
        }
    }

    #[tokio::test]
    async fn pid_liveness_probe() {
        // Our own process is alive; pid 0 targets the whole group, so use
        // an unlikely-to-exist high pid for the negative case.
        assert!(is_pid_alive(std::process::id()).await);
        assert!(!is_pid_alive(4_000_000).await);
    }
}
