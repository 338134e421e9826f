//! Per-process output monitoring.
//!
//! Two reader tasks consume stdout and stderr line-by-line: every line is
//! appended to a dedicated log file, pushed onto the process's bounded
//! rolling tail, and delivered to the supervisor's `on_line` callback.  A
//! waiter task awaits process exit, lets both readers drain, then invokes
//! `on_exit` — so hooks always see all output before the exit event.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::models::TrackedProcess;

/// Which output stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Invoked for every line read from a monitored process.
pub type LineCallback =
    Arc<dyn Fn(u32, StreamKind, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once when a monitored process exits.
pub type ExitCallback = Arc<dyn Fn(u32, Option<i32>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to the monitoring tasks of one subprocess.
pub struct OutputMonitor {
    pid: u32,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    waiter: Option<JoinHandle<()>>,
    exited: watch::Receiver<Option<Option<i32>>>,
}

impl OutputMonitor {
    /// Begin monitoring `child`.  The tracked process must already be
    /// registered so `on_line`/`on_exit` can look it up by pid.
    pub async fn start(
        pid: u32,
        mut child: Child,
        log_dir: &Path,
        process: Arc<Mutex<TrackedProcess>>,
        on_line: Option<LineCallback>,
        on_exit: ExitCallback,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        let stdout_log = log_dir.join("stdout.log");
        let stderr_log = log_dir.join("stderr.log");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(read_stream(
                pid,
                StreamKind::Stdout,
                BufReader::new(stdout),
                stdout_log.clone(),
                Arc::clone(&process),
                on_line.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(read_stream(
                pid,
                StreamKind::Stderr,
                BufReader::new(stderr),
                stderr_log.clone(),
                Arc::clone(&process),
                on_line,
            )));
        }

        let (exited_tx, exited_rx) = watch::channel(None);
        let waiter = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, error = %e, "waiting on subprocess failed");
                    None
                }
            };
            // Drain both readers before reporting exit so hooks see every
            // line ahead of the exit event.
            for reader in readers {
                let _ = reader.await;
            }
            debug!(pid, ?code, "process exited");
            let _ = exited_tx.send(Some(code));
            on_exit(pid, code).await;
        });

        Ok(Self {
            pid,
            stdout_log,
            stderr_log,
            waiter: Some(waiter),
            exited: exited_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// A receiver that resolves to `Some(exit_code)` once the process has
    /// exited and its output has drained.
    pub fn exited(&self) -> watch::Receiver<Option<Option<i32>>> {
        self.exited.clone()
    }

    /// Abort the monitoring tasks.  Only used when tearing down a monitor
    /// whose process will never be awaited again.
    pub fn stop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            waiter.abort();
        }
    }
}

async fn read_stream<R>(
    pid: u32,
    stream: StreamKind,
    reader: BufReader<R>,
    log_path: PathBuf,
    process: Arc<Mutex<TrackedProcess>>,
    on_line: Option<LineCallback>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut log_file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(pid, path = %log_path.display(), error = %e, "failed to open log file");
            None
        }
    };

    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(file) = log_file.as_mut() {
                    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                        warn!(pid, error = %e, "failed to write log line");
                        log_file = None;
                    }
                }
                {
                    let mut tracked = process.lock().await;
                    tracked.push_tail_line(line.clone());
                }
                if let Some(cb) = on_line.as_ref() {
                    cb(pid, stream, line).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(pid, stream = stream.as_str(), error = %e, "read error on pipe");
                break;
            }
        }
    }
    if let Some(mut file) = log_file {
        let _ = file.flush().await;
    }
}
