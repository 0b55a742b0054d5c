use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inclusive-start, exclusive-end range of TCP ports the allocator probes.
///
/// # Examples
///
/// ```
/// use fastdev_runner::config::PortRange;
///
/// let range = PortRange::default();
/// assert_eq!(range.start, 8000);
/// assert_eq!(range.end, 9000);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    /// First port to try.
    pub start: u16,
    /// End of the range; never probed itself.
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8000,
            end: 9000,
        }
    }
}

/// How supervised servers are launched.
///
/// The default launches `uvicorn` with an app module discovered in the
/// server's working directory. Tests substitute a stub program here to
/// exercise the lifecycle without a real ASGI server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    /// Executable to run; an absolute path or a command on PATH.
    #[serde(default = "default_launcher_program")]
    pub program: String,

    /// Host passed to the server via `--host`.
    #[serde(default = "default_launcher_host")]
    pub host: String,
}

fn default_launcher_program() -> String {
    "uvicorn".to_string()
}

fn default_launcher_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_launcher_program(),
            host: default_launcher_host(),
        }
    }
}

/// Thresholds and timeouts for health checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Memory usage (percent of total) above which `memory_ok` fails.
    #[serde(default = "default_memory_max")]
    pub memory_max_percent: f32,

    /// CPU usage (percent) above which `cpu_ok` fails.
    #[serde(default = "default_cpu_max")]
    pub cpu_max_percent: f32,

    /// Timeout for the TCP connect probe against the assigned port, in ms.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Upper bound for a whole health check, in ms. On breach the result is
    /// `unhealthy` with a timeout reason, not an error.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_memory_max() -> f32 {
    90.0
}

fn default_cpu_max() -> f32 {
    80.0
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_check_timeout_ms() -> u64 {
    5000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_max_percent: default_memory_max(),
            cpu_max_percent: default_cpu_max(),
            probe_timeout_ms: default_probe_timeout_ms(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl HealthConfig {
    /// Probe timeout as a [`Duration`].
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Whole-check timeout as a [`Duration`].
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// Main configuration for the FastDEV runner.
///
/// Every field has a default, so `RunnerConfig::default()` is a working
/// configuration. Persisted state lives under `~/.fastdev` unless
/// `state_file` overrides it.
///
/// # JSON Schema
///
/// ```json
/// {
///   "stateFile": "/home/user/.fastdev/servers.json",
///   "portRange": { "start": 8000, "end": 9000 },
///   "logBufferLines": 10000,
///   "graceTimeoutSecs": 30,
///   "launcher": { "program": "uvicorn", "host": "0.0.0.0" },
///   "health": {
///     "memoryMaxPercent": 90.0,
///     "cpuMaxPercent": 80.0,
///     "probeTimeoutMs": 500,
///     "checkTimeoutMs": 5000
///   }
/// }
/// ```
///
/// # Examples
///
/// Loading a configuration from a file:
///
/// ```no_run
/// use fastdev_runner::config::RunnerConfig;
///
/// let config = RunnerConfig::from_file("runner.json").unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Path of the durable server registry. `None` resolves to
    /// `~/.fastdev/servers.json`.
    #[serde(default)]
    pub state_file: Option<PathBuf>,

    /// Port range probed by the allocator.
    #[serde(default)]
    pub port_range: PortRange,

    /// Capacity of each server's log ring buffer, in lines.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    /// Seconds to wait for a graceful stop before force-killing.
    #[serde(default = "default_grace_timeout_secs")]
    pub grace_timeout_secs: u64,

    /// Launcher settings.
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Health check settings.
    #[serde(default)]
    pub health: HealthConfig,
}

fn default_log_buffer_lines() -> usize {
    10_000
}

fn default_grace_timeout_secs() -> u64 {
    30
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            port_range: PortRange::default(),
            log_buffer_lines: default_log_buffer_lines(),
            grace_timeout_secs: default_grace_timeout_secs(),
            launcher: LauncherConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Loads a configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON
    /// * The JSON does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        Self::parse_from_str(&content)
    }

    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or does not conform
    /// to the expected schema.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Resolves the state file path, falling back to `~/.fastdev/servers.json`.
    pub fn resolved_state_file(&self) -> PathBuf {
        match &self.state_file {
            Some(path) => path.clone(),
            None => home::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fastdev")
                .join("servers.json"),
        }
    }

    /// Grace timeout as a [`Duration`].
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.port_range.start, 8000);
        assert_eq!(config.port_range.end, 9000);
        assert_eq!(config.log_buffer_lines, 10_000);
        assert_eq!(config.grace_timeout_secs, 30);
        assert_eq!(config.launcher.program, "uvicorn");
    }

    #[test]
    fn test_parse_partial_config() {
        let config_str = r#"{
            "portRange": { "start": 9100, "end": 9200 },
            "launcher": { "program": "/usr/local/bin/uvicorn" }
        }"#;

        let config = RunnerConfig::parse_from_str(config_str).unwrap();

        assert_eq!(config.port_range.start, 9100);
        assert_eq!(config.port_range.end, 9200);
        assert_eq!(config.launcher.program, "/usr/local/bin/uvicorn");
        // Unspecified fields keep their defaults.
        assert_eq!(config.launcher.host, "0.0.0.0");
        assert_eq!(config.log_buffer_lines, 10_000);
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let result = RunnerConfig::parse_from_str("{ not json");
        assert!(result.is_err());
    }
}
