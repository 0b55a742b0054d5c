//! Validation for runner configuration.
//!
//! Parsing only guarantees well-formed JSON; this module checks that the
//! parsed values make operational sense before a `DevRunner` is built
//! around them.

use crate::config::RunnerConfig;
use crate::error::{Error, Result};

/// Validates a parsed [`RunnerConfig`].
///
/// # Errors
///
/// Returns [`Error::ConfigInvalid`] when:
/// * The port range is empty or inverted
/// * The log buffer capacity is zero
/// * The launcher program is empty
/// * A health timeout is zero
///
/// # Examples
///
/// ```
/// use fastdev_runner::config::{RunnerConfig, validate_config};
///
/// let config = RunnerConfig::default();
/// assert!(validate_config(&config).is_ok());
/// ```
pub fn validate_config(config: &RunnerConfig) -> Result<()> {
    if config.port_range.start >= config.port_range.end {
        return Err(Error::ConfigInvalid(format!(
            "Port range {}-{} is empty",
            config.port_range.start, config.port_range.end
        )));
    }

    if config.log_buffer_lines == 0 {
        return Err(Error::ConfigInvalid(
            "Log buffer capacity must be at least one line".to_string(),
        ));
    }

    if config.launcher.program.trim().is_empty() {
        return Err(Error::ConfigInvalid(
            "Launcher program must not be empty".to_string(),
        ));
    }

    if config.health.probe_timeout_ms == 0 || config.health.check_timeout_ms == 0 {
        return Err(Error::ConfigInvalid(
            "Health check timeouts must be non-zero".to_string(),
        ));
    }

    if config.health.probe_timeout_ms > config.health.check_timeout_ms {
        return Err(Error::ConfigInvalid(
            "Port probe timeout cannot exceed the whole-check timeout".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RunnerConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let mut config = RunnerConfig::default();
        config.port_range.start = 9000;
        config.port_range.end = 8000;
        assert!(matches!(
            validate_config(&config),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_rejects_zero_log_capacity() {
        let mut config = RunnerConfig::default();
        config.log_buffer_lines = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_empty_launcher() {
        let mut config = RunnerConfig::default();
        config.launcher.program = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_probe_timeout_above_check_timeout() {
        let mut config = RunnerConfig::default();
        config.health.probe_timeout_ms = 10_000;
        config.health.check_timeout_ms = 5_000;
        assert!(validate_config(&config).is_err());
    }
}
