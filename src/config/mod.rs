//! Configuration module for the FastDEV runner.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for the runner: the durable state file location, the port
//! range the allocator probes, log buffer capacity, launch settings, and
//! health check thresholds. Configurations load from files or strings in
//! JSON format, and every field has a working default.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use fastdev_runner::config::RunnerConfig;
//!
//! let config = RunnerConfig::from_file("runner.json").unwrap();
//! println!("Ports {}-{}", config.port_range.start, config.port_range.end);
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use fastdev_runner::config::{RunnerConfig, validate_config};
//!
//! let mut config = RunnerConfig::default();
//! config.port_range.start = 9100;
//! config.port_range.end = 9200;
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{HealthConfig, LauncherConfig, PortRange, RunnerConfig};
pub use validator::validate_config;
