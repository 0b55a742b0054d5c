/// Server supervision module for the FastDEV runner.
///
/// This module contains the pieces the lifecycle manager composes around
/// an OS process: spawning and exit detection, output capture, health
/// monitoring, and crash diagnosis.
///
/// # Components
///
/// * `command` - Derives the launch invocation from a record's mode and port
/// * `logs` - Bounded ring buffer shared by the capture task and readers
/// * `process` - Spawning, exit watching, and graceful termination
/// * `monitor` - Liveness and resource health checks
/// * `diagnose` - Pattern-rule parsing of captured failure output
///
/// # Examples
///
/// Diagnosing captured output:
///
/// ```
/// use fastdev_runner::server::CrashDiagnoser;
///
/// let diagnoser = CrashDiagnoser::new();
/// let output = vec!["ModuleNotFoundError: No module named 'httpx'".to_string()];
/// let diagnosis = diagnoser.diagnose(&output, None);
/// assert_eq!(diagnosis.solution, "Run: pip install httpx");
/// ```
pub mod command;
pub mod diagnose;
pub mod logs;
pub mod monitor;
mod process;

pub use command::{LaunchCommand, launch_command};
pub use diagnose::{CrashDiagnoser, CrashRule, Diagnosis, built_in_rules};
pub use logs::LogBuffer;
pub use monitor::{HealthChecks, HealthMonitor, HealthReport, HealthStatus, pid_alive};
pub use process::{ExitNotice, ProcessHandle, ProcessSupervisor};
pub(crate) use process::terminate_pid;
