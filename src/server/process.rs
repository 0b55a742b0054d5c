use crate::config::LauncherConfig;
use crate::error::{Error, Result};
use crate::server::command::launch_command;
use crate::server::logs::LogBuffer;
use crate::state::ServerRecord;
use async_process::{Command, Stdio};
use chrono::{DateTime, Utc};
use futures_lite::{AsyncBufReadExt, StreamExt, io::BufReader};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Message sent into the runner's serialization domain when a supervised
/// process exits.
///
/// Exit detection runs independently of any caller request; the notice
/// carries everything needed to finalize the record, including the log
/// buffer snapshot taken at the moment of exit.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    /// Logical server name.
    pub name: String,
    /// Launch generation the notice belongs to.
    pub launch_id: Uuid,
    /// OS process id that exited.
    pub pid: u32,
    /// Exit code, when the OS reported one.
    pub code: Option<i32>,
    /// Whether a stop had been requested before the exit.
    pub requested: bool,
    /// Log buffer snapshot as of exit, oldest first.
    pub final_output: Vec<String>,
    /// When the exit was observed.
    pub observed_at: DateTime<Utc>,
}

/// Live handle to a supervised OS process.
///
/// The child itself is owned by the exit-watcher task; the handle exposes
/// liveness, the stop-request flag, and the exit outcome once available.
/// Owned exclusively by the runner's per-server entry, never persisted.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    launch_id: Uuid,
    stop_requested: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    outcome: Arc<OnceLock<ExitNotice>>,
}

impl ProcessHandle {
    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Launch generation id.
    pub fn launch_id(&self) -> Uuid {
        self.launch_id
    }

    /// True while the process has not been observed to exit.
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// The exit notice, once the watcher has observed the exit.
    pub fn outcome(&self) -> Option<ExitNotice> {
        self.outcome.get().cloned()
    }

    /// Waits up to `limit` for the process to exit. Returns whether it
    /// has exited.
    pub async fn wait_exit(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.exit_notify.notified();
            if self.exited.load(Ordering::SeqCst) {
                return true;
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(_) => continue,
                Err(_) => return self.exited.load(Ordering::SeqCst),
            }
        }
    }

    /// Terminates the process: graceful signal first, then a forced kill
    /// once `grace` expires. This ordering is mandatory so child servers
    /// get a chance to release their resources.
    pub async fn terminate(&self, grace: Duration) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);

        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::debug!(pid = self.pid, "Sending graceful stop signal");
        send_signal(self.pid, Signal::Term)?;

        if self.wait_exit(grace).await {
            return Ok(());
        }

        tracing::warn!(
            pid = self.pid,
            grace_secs = grace.as_secs(),
            "Grace period expired, force killing"
        );
        send_signal(self.pid, Signal::Kill)?;
        self.wait_exit(Duration::from_secs(5)).await;

        Ok(())
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // ESRCH just means the process already exited.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::Process(format!(
                "Failed to signal pid {}: {}",
                pid, err
            )));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<()> {
    Err(Error::Process(format!(
        "Graceful termination of pid {} is only supported on unix",
        pid
    )))
}

/// Terminates a process known only by pid, graceful-then-forceful.
///
/// Used for servers adopted after a manager restart, where no live
/// handle exists.
pub(crate) async fn terminate_pid(pid: u32, grace: Duration) -> Result<()> {
    use crate::server::monitor::pid_alive;

    tracing::debug!(pid, "Sending graceful stop signal to adopted process");
    send_signal(pid, Signal::Term)?;

    let deadline = tokio::time::Instant::now() + grace;
    while pid_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(pid, "Grace period expired, force killing adopted process");
            send_signal(pid, Signal::Kill)?;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
}

/// Spawns and tracks server processes.
///
/// Each spawn pipes stdout and stderr into the record's log buffer and
/// registers an exit-watcher task that sends an [`ExitNotice`] once the
/// process terminates.
pub struct ProcessSupervisor {
    launcher: LauncherConfig,
    exit_tx: UnboundedSender<ExitNotice>,
}

impl ProcessSupervisor {
    /// Creates a supervisor launching with `launcher` and reporting
    /// exits on `exit_tx`.
    pub fn new(launcher: LauncherConfig, exit_tx: UnboundedSender<ExitNotice>) -> Self {
        Self { launcher, exit_tx }
    }

    /// Launches the process for `record` on `port`.
    ///
    /// Returns once the OS process is confirmed started; becoming
    /// healthy is the health monitor's job. Output capture and exit
    /// detection run as background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProcessSpawnFailed`] when the executable is
    /// missing or cannot be started; no background tasks are left
    /// behind in that case.
    pub fn spawn(&self, record: &ServerRecord, port: u16, logs: &LogBuffer) -> Result<ProcessHandle> {
        let cmd = launch_command(record, &self.launcher, port);
        tracing::debug!(
            server = %record.name,
            program = %cmd.program,
            args = ?cmd.args,
            "Spawning server process"
        );

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(&record.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ProcessSpawnFailed {
                name: record.name.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let launch_id = Uuid::new_v4();

        let stdout = child.stdout.take().ok_or_else(|| Error::Process(
            "Failed to get stdout pipe from child process".to_string(),
        ))?;
        let stderr = child.stderr.take().ok_or_else(|| Error::Process(
            "Failed to get stderr pipe from child process".to_string(),
        ))?;

        let out_task = spawn_capture(BufReader::new(stdout), logs.clone());
        let err_task = spawn_capture(BufReader::new(stderr), logs.clone());

        let handle = ProcessHandle {
            pid,
            launch_id,
            stop_requested: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            exit_notify: Arc::new(Notify::new()),
            outcome: Arc::new(OnceLock::new()),
        };

        // Exit watcher: owns the child, waits for termination, snapshots
        // the logs, then reports into the runner's serialization domain.
        let watcher_handle = handle.clone();
        let name = record.name.clone();
        let logs = logs.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let mut child = child;
            let status = child.status().await;

            // Drain the pipes fully before snapshotting the buffer.
            let _ = out_task.await;
            let _ = err_task.await;

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "Failed to collect exit status");
                    None
                }
            };

            let notice = ExitNotice {
                name: name.clone(),
                launch_id,
                pid,
                code,
                requested: watcher_handle.stop_requested.load(Ordering::SeqCst),
                final_output: logs.snapshot(),
                observed_at: Utc::now(),
            };
            tracing::info!(
                server = %name,
                pid,
                code = ?code,
                requested = notice.requested,
                "Server process exited"
            );

            let _ = watcher_handle.outcome.set(notice.clone());
            watcher_handle.exited.store(true, Ordering::SeqCst);
            watcher_handle.exit_notify.notify_waiters();

            // Receiver gone means the runner is shutting down.
            let _ = exit_tx.send(notice);
        });

        tracing::info!(server = %record.name, pid, port, "Server process started");
        Ok(handle)
    }
}

fn spawn_capture<R>(reader: BufReader<R>, logs: LogBuffer) -> tokio::task::JoinHandle<()>
where
    R: futures_lite::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => logs.push(line),
                Err(_) => break,
            }
        }
    })
}
