use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Running mode for a supervised server.
///
/// The mode governs the launch flags: `dev` enables hot-reload, `prod`
/// runs multiple workers, `test` runs a single quiet worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Development mode with hot-reload.
    #[default]
    Dev,
    /// Test mode: single worker, warning-level logs.
    Test,
    /// Production-like mode: multiple workers, no reload.
    Prod,
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerMode::Dev => "dev",
            ServerMode::Test => "test",
            ServerMode::Prod => "prod",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dev" => Ok(ServerMode::Dev),
            "test" => Ok(ServerMode::Test),
            "prod" => Ok(ServerMode::Prod),
            other => Err(format!("Unknown server mode: {}", other)),
        }
    }
}

/// Lifecycle state of a supervised server.
///
/// Transitions only happen inside the runner or the supervisor's
/// exit-detection task, never directly by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// No process; the record may still hold a persisted port.
    #[default]
    Stopped,
    /// A launch is in progress.
    Starting,
    /// The OS process is confirmed started.
    Running,
    /// The process exited without being asked to.
    Crashed,
    /// A requested termination is in progress.
    Stopping,
}

impl ServerState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Allowed edges: `stopped|crashed -> starting -> running`,
    /// `running|crashed -> stopping -> stopped`, `running -> crashed`,
    /// and `starting -> stopped` for spawn-failure rollback.
    pub fn can_transition(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Crashed)
                | (Running, Stopping)
                | (Crashed, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// A live record reserves its port; only `stopped` releases it for
    /// allocation to other servers.
    pub fn is_live(self) -> bool {
        self != ServerState::Stopped
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Crashed => "crashed",
            ServerState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Captured facts about a process exit.
///
/// `final_output` is the log buffer as of the moment of exit, so
/// diagnosis stays available after the process is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    /// OS exit code, if one was reported.
    pub code: Option<i32>,
    /// Whether the exit followed a `stop` request.
    pub requested: bool,
    /// When the exit was observed.
    pub crashed_at: DateTime<Utc>,
    /// Snapshot of the log buffer at exit, oldest first.
    pub final_output: Vec<String>,
}

/// One durable record per logical server name.
///
/// Persisted by the state store and keyed by `name`. The live process
/// handle is owned by the supervisor and never serialized; `pid` and
/// `launch_id` are hints used for reconciliation against OS reality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Unique logical name, the primary key.
    pub name: String,
    /// Working directory the process is launched from.
    pub path: PathBuf,
    /// Launch mode.
    pub mode: ServerMode,
    /// Assigned port; stable across restarts while it stays free.
    pub port: Option<u16>,
    /// Current lifecycle state.
    pub state: ServerState,
    /// OS process id of the last launch, if any.
    pub pid: Option<u32>,
    /// When the current (or last) process was started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the record was last health-checked.
    pub last_health_check_at: Option<DateTime<Utc>>,
    /// Facts about the last exit, present once the process has exited.
    pub exit: Option<ExitInfo>,
    /// Identifier of the launch generation; a stale exit watcher carrying
    /// an old id must not touch the record.
    pub launch_id: Option<Uuid>,
}

impl ServerRecord {
    /// Creates a fresh `stopped` record.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, mode: ServerMode) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mode,
            port: None,
            state: ServerState::Stopped,
            pid: None,
            started_at: None,
            last_health_check_at: None,
            exit: None,
            launch_id: None,
        }
    }

    /// Base URL of the server, once a port is assigned.
    pub fn url(&self) -> Option<String> {
        self.port.map(|p| format!("http://localhost:{}", p))
    }

    /// URL of the interactive API docs, once a port is assigned.
    pub fn docs_url(&self) -> Option<String> {
        self.port.map(|p| format!("http://localhost:{}/docs", p))
    }

    /// Caller-facing view of this record.
    pub fn details(&self) -> ServerDetails {
        ServerDetails {
            name: self.name.clone(),
            port: self.port,
            mode: self.mode,
            status: self.state,
            url: self.url(),
            docs_url: self.docs_url(),
        }
    }

    /// Human-readable uptime, while running.
    pub fn uptime(&self) -> Option<String> {
        if self.state != ServerState::Running {
            return None;
        }
        let started = self.started_at?;
        let elapsed = Utc::now().signed_duration_since(started);
        let secs = elapsed.num_seconds().max(0);
        Some(format!(
            "{}h {}m {}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        ))
    }
}

/// Caller-facing server description returned by lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetails {
    /// Logical server name.
    pub name: String,
    /// Assigned port, if any.
    pub port: Option<u16>,
    /// Launch mode.
    pub mode: ServerMode,
    /// Current lifecycle state.
    pub status: ServerState,
    /// Base URL, once a port is assigned.
    pub url: Option<String>,
    /// API docs URL, once a port is assigned.
    pub docs_url: Option<String>,
}

/// Compact per-server line for `list_servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    /// Logical server name.
    pub name: String,
    /// Assigned port, if any.
    pub port: Option<u16>,
    /// Launch mode.
    pub mode: ServerMode,
    /// Current lifecycle state.
    pub status: ServerState,
    /// Elapsed time since start, while running.
    pub uptime: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_edges() {
        use ServerState::*;
        assert!(Stopped.can_transition(Starting));
        assert!(Crashed.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Starting.can_transition(Stopped));
        assert!(Running.can_transition(Crashed));
        assert!(Running.can_transition(Stopping));
        assert!(Crashed.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));

        assert!(!Stopped.can_transition(Running));
        assert!(!Stopped.can_transition(Stopping));
        assert!(!Running.can_transition(Starting));
        assert!(!Stopping.can_transition(Running));
    }

    #[test]
    fn test_urls_require_port() {
        let mut record = ServerRecord::new("api", "/tmp/app", ServerMode::Dev);
        assert_eq!(record.url(), None);

        record.port = Some(8042);
        assert_eq!(record.url().as_deref(), Some("http://localhost:8042"));
        assert_eq!(
            record.docs_url().as_deref(),
            Some("http://localhost:8042/docs")
        );
    }

    #[test]
    fn test_record_serde_round_trip() {
        let mut record = ServerRecord::new("api", "/tmp/app", ServerMode::Prod);
        record.port = Some(8100);
        record.state = ServerState::Running;

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"mode\":\"prod\""));

        let back: ServerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "api");
        assert_eq!(back.port, Some(8100));
        assert_eq!(back.state, ServerState::Running);
    }
}
