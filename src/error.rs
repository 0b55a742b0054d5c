/// Error handling module for the FastDEV runner.
///
/// This module defines the error types used throughout the library.
/// It provides a comprehensive set of errors that can occur when
/// supervising development server processes, along with helpful
/// context for debugging.
///
/// # Example
///
/// ```
/// use fastdev_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::ServerNotFound(name)) => println!("Server '{}' is not registered", name),
///         Err(Error::PortUnavailable { start, end }) => {
///             println!("No free port between {} and {}", start, end)
///         }
///         Err(e) => println!("Operation failed: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

use crate::state::ServerState;

/// Errors that can occur in the fastdev-runner library.
///
/// This enum represents all possible error types that can be returned from
/// operations in the runner. Each variant includes context information to
/// help diagnose and handle the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON is malformed
    /// - Required fields are missing
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration is valid JSON but contains invalid values.
    ///
    /// This error occurs when:
    /// - The port range is empty or inverted
    /// - A timeout or buffer capacity is zero
    /// - The launcher program is empty
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The port allocator exhausted its configured range.
    ///
    /// This error occurs when every port in the range is either reserved
    /// by another live server record or occupied by an unrelated OS-level
    /// listener. It is reported to the caller, never retried silently.
    #[error("No free port available in range {start}-{end}")]
    PortUnavailable {
        /// First port of the probed range.
        start: u16,
        /// End of the probed range (exclusive).
        end: u16,
    },

    /// The server process could not be spawned.
    ///
    /// This error occurs when:
    /// - The launcher executable is missing from PATH
    /// - The working directory does not exist
    /// - The OS denies permission to execute
    ///
    /// The record is rolled back to `stopped` before this is returned.
    #[error("Failed to spawn process for server '{name}': {reason}")]
    ProcessSpawnFailed {
        /// Logical server name the spawn was attempted for.
        name: String,
        /// Underlying cause from the OS.
        reason: String,
    },

    /// The requested operation is incompatible with the record's state.
    ///
    /// This error occurs when:
    /// - `stop` is called on a server that is already stopped
    /// - A transition is attempted along an edge the state machine
    ///   does not allow
    ///
    /// No state is mutated when this is returned.
    #[error("Invalid transition for server '{name}': {from:?} -> {to:?}")]
    InvalidTransition {
        /// Logical server name.
        name: String,
        /// State the record was in.
        from: ServerState,
        /// State the operation tried to reach.
        to: ServerState,
    },

    /// Diagnosis was requested but the server has not crashed.
    ///
    /// This error occurs when:
    /// - `diagnose_crash` is called while the record state is not `crashed`
    /// - The server has never been started
    #[error("No crash recorded for server '{0}'")]
    NoCrashRecorded(String),

    /// Requested server was not found in the registry.
    ///
    /// This error occurs when a name is passed that no `ensure_running`
    /// call has ever registered.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Error reading or writing the durable state file.
    ///
    /// This error occurs when:
    /// - The state file cannot be created or read
    /// - The persisted JSON is malformed
    #[error("State store error: {0}")]
    StateStore(String),

    /// Error when terminating or inspecting a server process.
    ///
    /// This error occurs when:
    /// - A stop signal cannot be delivered
    /// - The child handle is gone while the record says it is live
    #[error("Server process error: {0}")]
    Process(String),
}

/// Result type for fastdev-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error`
/// type from this module. Use this throughout the library and in client code
/// to handle errors in a consistent way.
pub type Result<T> = std::result::Result<T, Error>;
