use crate::config::HealthConfig;
use crate::state::ServerRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::net::TcpStream;

/// Overall health verdict for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks passed.
    Healthy,
    /// Running, but a resource threshold is breached or the port probe
    /// failed.
    Degraded,
    /// The process is not running, or the check timed out.
    Unhealthy,
}

/// Individual check outcomes inside a [`HealthReport`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    /// Whether the supervisor reports a live OS process.
    pub process_running: bool,
    /// Best-effort TCP connect probe against the assigned port. A soft
    /// signal: some servers refuse bare probes during startup.
    pub port_accessible: bool,
    /// Memory usage below the configured threshold.
    pub memory_ok: bool,
    /// CPU usage below the configured threshold.
    pub cpu_ok: bool,
}

/// Result of a health check.
///
/// Breaching a threshold downgrades the status and adds a
/// recommendation; it never terminates the process. Remediation is the
/// caller's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Process CPU usage in percent, summed across cores.
    pub cpu_percent: f32,
    /// Process memory usage as a percent of total system memory.
    pub memory_percent: f32,
    /// Individual check outcomes.
    pub checks: HealthChecks,
    /// Suggested operator actions for breached soft thresholds.
    pub recommendations: Vec<String>,
    /// Why the status is what it is, when not obvious from the checks.
    pub reason: Option<String>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// Probes running servers for liveness and resource usage.
///
/// Holds a persistent [`System`] so per-process CPU usage is measured
/// against the previous refresh rather than always reading zero.
pub struct HealthMonitor {
    config: HealthConfig,
    system: Arc<Mutex<System>>,
}

impl HealthMonitor {
    /// Creates a monitor with the given thresholds and timeouts.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Checks `record`, given the supervisor's liveness verdict.
    ///
    /// Never blocks longer than the configured check timeout; on breach
    /// the result is `unhealthy` with a timeout reason, not an error.
    /// No record lock is held while the network probe waits.
    pub async fn check(&self, record: &ServerRecord, process_running: bool) -> HealthReport {
        match tokio::time::timeout(
            self.config.check_timeout(),
            self.run_checks(record, process_running),
        )
        .await
        {
            Ok(report) => report,
            Err(_) => {
                tracing::warn!(server = %record.name, "Health check timed out");
                HealthReport {
                    status: HealthStatus::Unhealthy,
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    checks: HealthChecks {
                        process_running,
                        port_accessible: false,
                        memory_ok: false,
                        cpu_ok: false,
                    },
                    recommendations: Vec::new(),
                    reason: Some("health check timed out".to_string()),
                    checked_at: Utc::now(),
                }
            }
        }
    }

    async fn run_checks(&self, record: &ServerRecord, process_running: bool) -> HealthReport {
        let port_accessible = match (process_running, record.port) {
            (true, Some(port)) => self.probe_port(port).await,
            _ => false,
        };

        let (cpu_percent, memory_percent) = match (process_running, record.pid) {
            (true, Some(pid)) => self.sample_process(pid).await,
            _ => (0.0, 0.0),
        };

        let checks = HealthChecks {
            process_running,
            port_accessible,
            memory_ok: memory_percent < self.config.memory_max_percent,
            cpu_ok: cpu_percent < self.config.cpu_max_percent,
        };

        let mut recommendations = Vec::new();
        if memory_percent > 80.0 {
            recommendations.push(
                "Memory usage is high. Consider increasing available memory.".to_string(),
            );
        }
        if cpu_percent > 70.0 {
            recommendations.push(
                "CPU usage is high. Consider optimizing endpoints or scaling.".to_string(),
            );
        }

        let (status, reason) = if !checks.process_running {
            (
                HealthStatus::Unhealthy,
                Some("server process is not running".to_string()),
            )
        } else if !checks.memory_ok || !checks.cpu_ok || !checks.port_accessible {
            (HealthStatus::Degraded, None)
        } else {
            (HealthStatus::Healthy, None)
        };

        HealthReport {
            status,
            cpu_percent,
            memory_percent,
            checks,
            recommendations,
            reason,
            checked_at: Utc::now(),
        }
    }

    async fn probe_port(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.config.probe_timeout(),
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn sample_process(&self, pid: u32) -> (f32, f32) {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(|e| e.into_inner());
            sys.refresh_memory();
            sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);

            match sys.process(Pid::from_u32(pid)) {
                Some(proc_info) => {
                    let total = sys.total_memory().max(1);
                    let memory_percent = proc_info.memory() as f32 / total as f32 * 100.0;
                    (proc_info.cpu_usage(), memory_percent)
                }
                None => (0.0, 0.0),
            }
        })
        .await
        .unwrap_or((0.0, 0.0))
    }
}

/// Checks whether a pid refers to a live OS process.
///
/// Used for reconciling persisted records against reality; persisted
/// state is a hint, process existence is ground truth.
pub fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys.process(Pid::from_u32(pid)).is_some()
}
