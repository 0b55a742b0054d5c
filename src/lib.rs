/*!
 # FastDEV Runner

 A Rust library for supervising named, long-lived development server
 processes on behalf of an automated caller.

 ## Overview

 FastDEV Runner provides functionality to:
 - Start a named server only if it is not already running (idempotent)
 - Allocate a non-conflicting port and keep it stable across restarts
 - Persist server records across manager restarts, reconciling them
   against OS reality
 - Capture server output into a bounded ring buffer and answer log queries
 - Probe liveness and resource health of running servers
 - Parse captured failure output into a structured crash diagnosis

 ## Basic Usage

 ```no_run
 use fastdev_runner::{DevRunner, RunnerConfig, ServerMode, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let runner = DevRunner::open(RunnerConfig::default())?;

     // Start (or observe) the server named "api".
     let outcome = runner.ensure_running("api", "/srv/app", ServerMode::Dev).await?;
     println!("{}: {}", outcome.status, outcome.message);

     // Query logs and health.
     let lines = runner.get_logs("api", 50, None).await?;
     println!("last {} lines", lines.len());

     let report = runner.health_check("api").await?;
     println!("health: {:?}", report.status);

     runner.stop("api").await?;
     Ok(())
 }
 ```

 ## Features

 - **Idempotent starts**: `ensure_running` never launches a duplicate
 - **Durable registry**: records survive manager restarts
 - **Port stability**: assigned ports are reused while they stay free
 - **Crash diagnosis**: data-driven pattern rules over captured output
 - **Async support**: full async/await support

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod error;
pub mod port;
pub mod server;
pub mod state;

pub use config::RunnerConfig;
pub use error::{Error, Result};
pub use server::{CrashDiagnoser, Diagnosis, HealthReport, HealthStatus, LogBuffer};
pub use state::{ServerDetails, ServerMode, ServerRecord, ServerState, ServerSummary};

use chrono::Utc;
use port::PortAllocator;
use serde::{Deserialize, Serialize};
use server::{ExitNotice, HealthMonitor, LogBuffer as Logs, ProcessHandle, ProcessSupervisor};
use server::{logs::tail_lines, pid_alive, terminate_pid};
use state::{ExitInfo, StateStore};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::sync::mpsc;

/// How an `ensure_running` call concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureStatus {
    /// A new process was launched.
    Started,
    /// The server was already running; nothing was done.
    AlreadyRunning,
}

impl fmt::Display for EnsureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnsureStatus::Started => "started",
            EnsureStatus::AlreadyRunning => "already_running",
        };
        write!(f, "{}", s)
    }
}

/// Response payload of [`DevRunner::ensure_running`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureOutcome {
    /// Whether a launch happened.
    pub status: EnsureStatus,
    /// Current server description.
    pub server: ServerDetails,
    /// Human-readable summary.
    pub message: String,
}

/// Response payload of [`DevRunner::stop`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// Always `"success"` when the call returns `Ok`.
    pub status: String,
    /// Human-readable summary.
    pub message: String,
}

/// Process-launch context handed to external collaborators such as
/// test runners and code analyzers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchContext {
    /// Working directory the server launches from.
    pub path: PathBuf,
    /// Assigned port, if one has been allocated.
    pub port: Option<u16>,
}

/// Per-server runtime entry: the serialization domain for one logical
/// server plus the resources that never persist.
struct ServerEntry {
    /// Serializes state-changing operations and exit notifications for
    /// this name. Never held while waiting on network I/O.
    op_lock: Arc<tokio::sync::Mutex<()>>,
    /// Shared output ring buffer for the current (or last) launch.
    logs: Logs,
    /// Live process handle, owned exclusively here.
    handle: Mutex<Option<ProcessHandle>>,
}

impl ServerEntry {
    fn new(log_capacity: usize) -> Self {
        Self {
            op_lock: Arc::new(tokio::sync::Mutex::new(())),
            logs: Logs::new(log_capacity),
            handle: Mutex::new(None),
        }
    }

    fn current_handle(&self) -> Option<ProcessHandle> {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_handle(&self, handle: Option<ProcessHandle>) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }
}

struct RunnerInner {
    config: RunnerConfig,
    store: Mutex<StateStore>,
    entries: RwLock<HashMap<String, Arc<ServerEntry>>>,
    /// Serializes port selection across all names: the reserved-set
    /// read, the bind probe, and the persisting write form one critical
    /// section, so two concurrent allocations can never pick the same
    /// port.
    alloc_lock: tokio::sync::Mutex<()>,
    allocator: PortAllocator,
    monitor: HealthMonitor,
    diagnoser: CrashDiagnoser,
    supervisor: ProcessSupervisor,
}

/// Supervises named development server processes.
///
/// This struct is the main entry point: it owns the mapping between a
/// logical server name and an OS process, makes the start/no-op decision
/// idempotently, allocates and persists ports, supervises process
/// health, and parses failure output into a structured diagnosis.
///
/// Operations on different names proceed fully in parallel; operations
/// on the same name are serialized through a per-record lock, which the
/// asynchronous exit detection also acquires before mutating state.
/// Cloning is cheap and shares the runner.
/// All public methods are instrumented with `tracing` spans.
#[derive(Clone)]
pub struct DevRunner {
    inner: Arc<RunnerInner>,
}

impl DevRunner {
    /// Opens a runner over the given configuration.
    ///
    /// Loads the durable registry and reconciles every record that
    /// claims to be live: a record whose pid no longer exists is
    /// corrected to `stopped` before any request is served; a record
    /// whose pid is still alive is adopted as `running`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config))]
    pub fn open(config: RunnerConfig) -> Result<Self> {
        config::validate_config(&config)?;

        let state_file = config.resolved_state_file();
        tracing::info!(state_file = %state_file.display(), "Opening server registry");
        let mut store = StateStore::open(&state_file)?;

        // Persisted state is a hint; process existence is ground truth.
        for mut record in store.list_all() {
            if !record.state.is_live() || record.state == ServerState::Crashed {
                continue;
            }
            let alive = record.pid.map(pid_alive).unwrap_or(false);
            if alive {
                if record.state != ServerState::Running {
                    record.state = ServerState::Running;
                    store.put(record)?;
                }
                continue;
            }
            tracing::info!(
                server = %record.name,
                pid = ?record.pid,
                "Reconciling stale record to stopped"
            );
            record.state = ServerState::Stopped;
            record.pid = None;
            record.launch_id = None;
            store.put(record)?;
        }

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<ExitNotice>();
        let supervisor = ProcessSupervisor::new(config.launcher.clone(), exit_tx);

        let inner = Arc::new(RunnerInner {
            alloc_lock: tokio::sync::Mutex::new(()),
            allocator: PortAllocator::new(config.port_range),
            monitor: HealthMonitor::new(config.health),
            diagnoser: CrashDiagnoser::new(),
            supervisor,
            store: Mutex::new(store),
            entries: RwLock::new(HashMap::new()),
            config,
        });

        // Exit notices enter the same per-record serialization domain as
        // foreground operations. The task holds only a weak reference, so
        // dropping the last runner clone closes the channel and ends it.
        let weak: Weak<RunnerInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(notice) = exit_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.apply_exit(notice).await;
            }
        });

        Ok(Self { inner })
    }

    /// Ensures the server `name` is running, launching it only if needed.
    ///
    /// If the record exists, says `running`, and the process is live,
    /// this is a no-op returning the current info with status
    /// `already_running` and the same port as before. Otherwise a port
    /// is allocated (reusing the persisted one when free), the
    /// allocation is persisted, and the process is spawned.
    ///
    /// # Errors
    ///
    /// * [`Error::PortUnavailable`] when the port range is exhausted
    /// * [`Error::ProcessSpawnFailed`] when the launch fails; the
    ///   record is rolled back to `stopped`
    /// * [`Error::InvalidTransition`] when the record is in a state
    ///   that cannot start
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, path), fields(server_name = %name))]
    pub async fn ensure_running(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        mode: ServerMode,
    ) -> Result<EnsureOutcome> {
        let inner = &self.inner;
        let (entry, _guard) = inner.lock_entry(name).await;

        let mut record = inner
            .store_get(name)
            .unwrap_or_else(|| ServerRecord::new(name, path.as_ref(), mode));

        // Reconcile a running record against process reality.
        if record.state == ServerState::Running {
            let handle = entry.current_handle();
            let alive = match &handle {
                Some(handle) => handle.is_alive(),
                None => record.pid.map(pid_alive).unwrap_or(false),
            };

            if alive {
                tracing::debug!(port = ?record.port, "Server already running");
                let mut message = format!(
                    "Server '{}' already running on port {}",
                    name,
                    record.port.unwrap_or(0)
                );
                if record.mode == ServerMode::Dev {
                    message.push_str(" with hot-reload");
                }
                return Ok(EnsureOutcome {
                    status: EnsureStatus::AlreadyRunning,
                    server: record.details(),
                    message,
                });
            }

            // The process is gone. Use the watcher's outcome when we have
            // it; an adopted record only tells us the pid is dead.
            match handle.as_ref().and_then(|h| h.outcome()) {
                Some(notice) if Some(notice.launch_id) == record.launch_id => {
                    finalize_exit(&mut record, &notice);
                }
                _ => {
                    record.state = ServerState::Stopped;
                    record.pid = None;
                    record.launch_id = None;
                }
            }
            entry.set_handle(None);
            inner.store_put(record.clone())?;
            tracing::info!(state = %record.state, "Reconciled dead server before start");
        }

        if !record.state.can_transition(ServerState::Starting) {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                from: record.state,
                to: ServerState::Starting,
            });
        }

        // Launch parameters follow the latest request.
        record.path = path.as_ref().to_path_buf();
        record.mode = mode;
        record.state = ServerState::Starting;

        // Allocate and persist the port before launching. The per-name
        // lock does not cover other names, so the whole selection runs
        // under the cross-name allocation lock.
        let port = {
            let _alloc = inner.alloc_lock.lock().await;
            let reserved = {
                let mut reserved = inner.store_reserved_ports();
                if let Some(port) = record.port {
                    reserved.remove(&port);
                }
                reserved
            };
            let port = match inner.allocator.allocate(record.port, &reserved).await {
                Ok(port) => port,
                Err(e) => {
                    tracing::error!(error = %e, "Port allocation failed");
                    return Err(e);
                }
            };
            record.port = Some(port);
            inner.store_put(record.clone())?;
            port
        };

        entry.logs.clear();
        match inner.supervisor.spawn(&record, port, &entry.logs) {
            Ok(handle) => {
                record.pid = Some(handle.pid());
                record.launch_id = Some(handle.launch_id());
                record.started_at = Some(Utc::now());
                record.exit = None;
                record.state = ServerState::Running;
                inner.store_put(record.clone())?;
                entry.set_handle(Some(handle));

                tracing::info!(port, "Server started");
                Ok(EnsureOutcome {
                    status: EnsureStatus::Started,
                    server: record.details(),
                    message: format!("Server '{}' started on port {}", name, port),
                })
            }
            Err(e) => {
                // Full rollback: no half-started record survives.
                tracing::error!(error = %e, "Spawn failed, rolling back");
                record.state = ServerState::Stopped;
                record.pid = None;
                record.launch_id = None;
                inner.store_put(record)?;
                Err(e)
            }
        }
    }

    /// Gracefully stops the server `name` and releases its port
    /// reservation. The persisted port is kept as a preference for the
    /// next start.
    ///
    /// # Errors
    ///
    /// * [`Error::ServerNotFound`] when no record exists
    /// * [`Error::InvalidTransition`] when the server is not in a
    ///   stoppable state (`running` or `crashed`)
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let inner = &self.inner;
        if inner.store_get(name).is_none() {
            return Err(Error::ServerNotFound(name.to_string()));
        }
        let (entry, _guard) = inner.lock_entry(name).await;

        let mut record = inner
            .store_get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        if !record.state.can_transition(ServerState::Stopping) {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                from: record.state,
                to: ServerState::Stopping,
            });
        }

        let was_crashed = record.state == ServerState::Crashed;
        record.state = ServerState::Stopping;
        inner.store_put(record.clone())?;

        let grace = inner.config.grace_timeout();
        let handle = entry.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        match handle {
            Some(handle) => {
                handle.terminate(grace).await?;
                match handle.outcome() {
                    Some(notice) => finalize_exit(&mut record, &notice),
                    None => {
                        record.exit = Some(ExitInfo {
                            code: None,
                            requested: true,
                            crashed_at: Utc::now(),
                            final_output: entry.logs.snapshot(),
                        });
                        record.state = ServerState::Stopped;
                        record.pid = None;
                        record.launch_id = None;
                    }
                }
            }
            None => {
                // Crashed servers and adopted processes have no handle.
                if let Some(pid) = record.pid.filter(|&pid| !was_crashed && pid_alive(pid)) {
                    terminate_pid(pid, grace).await?;
                    record.exit = Some(ExitInfo {
                        code: None,
                        requested: true,
                        crashed_at: Utc::now(),
                        final_output: entry.logs.snapshot(),
                    });
                }
                record.state = ServerState::Stopped;
                record.pid = None;
                record.launch_id = None;
            }
        }
        // Requested terminations always settle on stopped.
        record.state = ServerState::Stopped;
        inner.store_put(record)?;

        tracing::info!("Server stopped");
        Ok(StopOutcome {
            status: "success".to_string(),
            message: format!("Server '{}' stopped", name),
        })
    }

    /// Returns up to `tail` recent log lines for `name`, most recent
    /// last, optionally filtered to lines containing `level`.
    ///
    /// After a manager restart the live buffer is empty; the snapshot
    /// captured at the last exit is served instead, so crash output
    /// stays queryable.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn get_logs(
        &self,
        name: &str,
        tail: usize,
        level: Option<&str>,
    ) -> Result<Vec<String>> {
        let inner = &self.inner;
        let record = inner
            .store_get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        let entries = inner.entries.read().await;
        if let Some(entry) = entries.get(name) {
            if !entry.logs.is_empty() {
                return Ok(entry.logs.tail(tail, level));
            }
        }

        match &record.exit {
            Some(exit) => Ok(tail_lines(&exit.final_output, tail, level)),
            None => Ok(Vec::new()),
        }
    }

    /// Runs a bounded health check against `name`.
    ///
    /// The per-record lock is not held while the network probe waits;
    /// only the `last_health_check_at` stamp is written under it.
    /// A check that exceeds its timeout reports `unhealthy` with a
    /// timeout reason instead of failing.
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn health_check(&self, name: &str) -> Result<HealthReport> {
        let inner = &self.inner;
        let record = inner
            .store_get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        let entry = inner.entry(name).await;

        let process_running = match entry.current_handle() {
            Some(handle) => handle.is_alive(),
            None => {
                record.state == ServerState::Running
                    && record.pid.map(pid_alive).unwrap_or(false)
            }
        };

        let report = inner.monitor.check(&record, process_running).await;

        {
            let (_entry, _guard) = inner.lock_entry(name).await;
            if let Some(mut current) = inner.store_get(name) {
                current.last_health_check_at = Some(report.checked_at);
                inner.store_put(current)?;
            }
        }

        Ok(report)
    }

    /// Diagnoses why `name` crashed, from the output captured at exit.
    ///
    /// # Errors
    ///
    /// * [`Error::ServerNotFound`] when no record exists
    /// * [`Error::NoCrashRecorded`] when the server state is not
    ///   `crashed`
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn diagnose_crash(&self, name: &str) -> Result<Diagnosis> {
        let inner = &self.inner;
        let record = inner
            .store_get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        if record.state != ServerState::Crashed {
            return Err(Error::NoCrashRecorded(name.to_string()));
        }
        let exit = record
            .exit
            .as_ref()
            .ok_or_else(|| Error::NoCrashRecorded(name.to_string()))?;

        Ok(inner
            .diagnoser
            .diagnose(&exit.final_output, Some(exit.crashed_at)))
    }

    /// Lists all registered servers with their current status.
    pub fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .inner
            .store_list()
            .into_iter()
            .map(|record| ServerSummary {
                name: record.name.clone(),
                port: record.port,
                mode: record.mode,
                status: record.state,
                uptime: record.uptime(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Detailed description of one server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerNotFound`] when no record exists.
    pub fn server_info(&self, name: &str) -> Result<ServerDetails> {
        self.inner
            .store_get(name)
            .map(|record| record.details())
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Launch context for external collaborators (test runners, code
    /// analyzers): the working directory and assigned port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerNotFound`] when no record exists.
    pub fn launch_context(&self, name: &str) -> Result<LaunchContext> {
        self.inner
            .store_get(name)
            .map(|record| LaunchContext {
                path: record.path.clone(),
                port: record.port,
            })
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Removes a stopped server's record from the registry.
    ///
    /// # Errors
    ///
    /// * [`Error::ServerNotFound`] when no record exists
    /// * [`Error::InvalidTransition`] when the server is not stopped
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(server_name = %name))]
    pub async fn remove(&self, name: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.store_get(name).is_none() {
            return Err(Error::ServerNotFound(name.to_string()));
        }
        let (_entry, _guard) = inner.lock_entry(name).await;

        let record = inner
            .store_get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        if record.state != ServerState::Stopped {
            return Err(Error::InvalidTransition {
                name: name.to_string(),
                from: record.state,
                to: ServerState::Stopped,
            });
        }

        inner.store_delete(name)?;
        // The map entry goes away while the lock is still held; anyone
        // blocked on it re-validates and retries against a fresh entry.
        inner.entries.write().await.remove(name);
        tracing::info!("Server removed from registry");
        Ok(())
    }
}

impl RunnerInner {
    async fn entry(&self, name: &str) -> Arc<ServerEntry> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(name) {
                return Arc::clone(entry);
            }
        }
        let mut entries = self.entries.write().await;
        Arc::clone(
            entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServerEntry::new(self.config.log_buffer_lines))),
        )
    }

    /// Acquires the per-name lock, then re-checks that the locked entry
    /// is still the registered one. An entry that `remove` took out of
    /// the map while we waited is discarded and the acquisition retried
    /// against the fresh entry, so two callers can never hold different
    /// locks for the same name.
    async fn lock_entry(&self, name: &str) -> (Arc<ServerEntry>, OwnedMutexGuard<()>) {
        loop {
            let entry = self.entry(name).await;
            let guard = Arc::clone(&entry.op_lock).lock_owned().await;
            let current = self.entries.read().await.get(name).map(Arc::clone);
            if let Some(current) = current {
                if Arc::ptr_eq(&current, &entry) {
                    return (entry, guard);
                }
            }
        }
    }

    /// Applies an exit notice inside the record's serialization domain.
    /// A notice from a superseded launch generation is dropped.
    async fn apply_exit(&self, notice: ExitNotice) {
        let (entry, _guard) = self.lock_entry(&notice.name).await;

        let Some(mut record) = self.store_get(&notice.name) else {
            return;
        };
        if record.launch_id != Some(notice.launch_id) {
            tracing::debug!(server = %notice.name, "Ignoring stale exit notice");
            return;
        }

        finalize_exit(&mut record, &notice);
        entry.set_handle(None);
        if let Err(e) = self.store_put(record) {
            tracing::error!(server = %notice.name, error = %e, "Failed to persist exit state");
        }
    }

    fn store_get(&self, name: &str) -> Option<ServerRecord> {
        self.store.lock().unwrap_or_else(|e| e.into_inner()).get(name)
    }

    fn store_put(&self, record: ServerRecord) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(record)
    }

    fn store_delete(&self, name: &str) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delete(name)
    }

    fn store_list(&self) -> Vec<ServerRecord> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .list_all()
    }

    fn store_reserved_ports(&self) -> std::collections::HashSet<u16> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reserved_ports()
    }
}

/// Settles a record from an exit notice: `stopped` for a requested or
/// clean exit, `crashed` otherwise. The log snapshot from the notice
/// becomes the record's exit output.
fn finalize_exit(record: &mut ServerRecord, notice: &ExitNotice) {
    let clean = notice.requested || notice.code == Some(0) || record.state == ServerState::Stopping;
    let next = if clean {
        ServerState::Stopped
    } else {
        ServerState::Crashed
    };

    tracing::info!(
        server = %record.name,
        code = ?notice.code,
        state = %next,
        "Finalizing server exit"
    );

    record.exit = Some(ExitInfo {
        code: notice.code,
        requested: notice.requested,
        crashed_at: notice.observed_at,
        final_output: notice.final_output.clone(),
    });
    record.state = next;
    record.pid = None;
    record.launch_id = None;
}
